//! Pull and trim protocol tests
//!
//! A card with a sync queue and a sync data replica on the primary
//! cluster and an async data replica on a remote cluster. The remote
//! replica only sees writes by pulling them from the queue, and the queue
//! may only drop rows every other replica has already replicated.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use chaos_replication::card::CardOptions;
use chaos_replication::client::ChaosClient;
use chaos_replication::clock::ManualClock;
use chaos_replication::coordinator::{CoordinatorCell, CoordinatorManager, LocalCoordinatorTransport};
use chaos_replication::era::{EraEngine, TabletObserver};
use chaos_replication::errors::{ChaosError, ErrorCategory};
use chaos_replication::manager::{ChaosManager, CreateCardRequest, CreateReplicaRequest, ManagerOptions};
use chaos_replication::observability::MetricsRegistry;
use chaos_replication::progress::ReplicationProgress;
use chaos_replication::pull::{
    is_ordered_by_timestamp, pull_rows, trim_replicated_rows, trim_rows, PullRowsRequest, ReplicaPuller,
};
use chaos_replication::replica::{ContentType, ReplicaAttributes, ReplicaMode};
use chaos_replication::storage::{ClusterDirectory, MemoryReplicaStore, ReplicaStore, TableSchema};
use chaos_replication::types::{CardId, CellId, Key, ReplicaId, RowKey, Timestamp};

const TIMEOUT: Duration = Duration::from_secs(1);

struct Topology {
    manager: Arc<ChaosManager>,
    engine: EraEngine,
    client: ChaosClient,
    primary: Arc<MemoryReplicaStore>,
    remote: Arc<MemoryReplicaStore>,
    card_id: CardId,
    queue: ReplicaId,
    remote_data: ReplicaId,
    puller: ReplicaPuller,
}

async fn settle(manager: &Arc<ChaosManager>, card_id: CardId) {
    let card = manager.get_card(card_id).await.unwrap();
    for replica_id in card.replicas.keys() {
        TabletObserver::new(Arc::clone(manager), *replica_id)
            .observe()
            .await
            .unwrap();
    }
}

async fn topology(options: CardOptions) -> Topology {
    let manager = Arc::new(ChaosManager::new(
        Arc::new(ManualClock::new(None, Timestamp::from_parts(1_000, 0))),
        Arc::new(MetricsRegistry::new()),
        ManagerOptions::default(),
    ));
    let coordinators = Arc::new(CoordinatorManager::new());
    coordinators
        .update_cells(&[CoordinatorCell::new(CellId::generate(), None)], &[])
        .unwrap();
    let engine = EraEngine::new(
        Arc::clone(&manager),
        coordinators,
        Arc::new(LocalCoordinatorTransport::new()),
        TIMEOUT,
    );

    let primary = Arc::new(MemoryReplicaStore::new("primary"));
    let remote = Arc::new(MemoryReplicaStore::new("remote"));
    primary
        .create_table(
            "//q",
            TableSchema::sorted(ContentType::Queue, vec![Key::int(100)]).unwrap(),
        )
        .await
        .unwrap();
    primary
        .create_table("//d", TableSchema::sorted(ContentType::Data, vec![]).unwrap())
        .await
        .unwrap();
    remote
        .create_table("//r", TableSchema::sorted(ContentType::Data, vec![]).unwrap())
        .await
        .unwrap();
    let directory = Arc::new(ClusterDirectory::new());
    directory.register(primary.clone()).unwrap();
    directory.register(remote.clone()).unwrap();

    let card_id = manager
        .create_card(CreateCardRequest {
            options,
            ..Default::default()
        })
        .unwrap();
    let mut ids = Vec::new();
    for attributes in [
        ReplicaAttributes::new("primary", "//q", ContentType::Queue, ReplicaMode::Sync, true)
            .with_tablet_count(2),
        ReplicaAttributes::new("primary", "//d", ContentType::Data, ReplicaMode::Sync, true),
        ReplicaAttributes::new("remote", "//r", ContentType::Data, ReplicaMode::Async, true),
    ] {
        ids.push(
            manager
                .create_replica(card_id, CreateReplicaRequest::new(attributes))
                .await
                .unwrap(),
        );
    }
    assert_eq!(engine.advance_card(card_id).await.unwrap(), Some(1));
    settle(&manager, card_id).await;

    let client = ChaosClient::new(Arc::clone(&manager), Arc::clone(&directory), TIMEOUT);
    let puller = ReplicaPuller::new(Arc::clone(&manager), directory, ids[2], 16, TIMEOUT);
    Topology {
        manager,
        engine,
        client,
        primary,
        remote,
        card_id,
        queue: ids[0],
        remote_data: ids[2],
        puller,
    }
}

/// Write keys 1, 150 and 2 in that order; returns the last timestamp
async fn write_rows(t: &Topology) -> Timestamp {
    let mut last = Timestamp::MIN;
    for key in [1i64, 150, 2] {
        let written = t
            .client
            .insert_rows(t.card_id, vec![(RowKey::int(key), json!(key))])
            .await
            .unwrap();
        last = written.timestamp;
    }
    last
}

async fn remote_progress(t: &Topology) -> ReplicationProgress {
    let card = t.manager.get_card(t.card_id).await.unwrap();
    card.replica(t.remote_data)
        .unwrap()
        .replication_progress()
        .clone()
}

// =============================================================================
// Pull
// =============================================================================

#[tokio::test]
async fn test_async_replica_catches_up_by_pull() {
    let t = topology(CardOptions::default()).await;
    let last = write_rows(&t).await;

    let keys = [RowKey::int(1), RowKey::int(2), RowKey::int(150)];
    let before = t.remote.lookup_rows("//r", &keys, last).await.unwrap();
    assert!(before.iter().all(Option::is_none));
    let in_sync = t.client.get_in_sync_replicas(t.card_id, None, last).await.unwrap();
    assert!(!in_sync.contains(&t.remote_data));

    assert_eq!(t.puller.pull_once().await.unwrap(), 3);
    let after = t.remote.lookup_rows("//r", &keys, last).await.unwrap();
    let values: Vec<_> = after.into_iter().map(|r| r.map(|r| r.value)).collect();
    assert_eq!(values, vec![Some(json!(1)), Some(json!(2)), Some(json!(150))]);

    assert!(remote_progress(&t).await.is_at_least(last));
    let in_sync = t.client.get_in_sync_replicas(t.card_id, None, last).await.unwrap();
    assert!(in_sync.contains(&t.remote_data));

    // Nothing new upstream
    assert_eq!(t.puller.pull_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_pull_is_pure_and_resumable() {
    let t = topology(CardOptions::default()).await;
    let last = write_rows(&t).await;

    let request = PullRowsRequest::new(remote_progress(&t).await, t.queue)
        .with_upper_timestamp(last)
        .ordered();
    let first = pull_rows(t.primary.as_ref(), "//q", &request).await.unwrap();
    let second = pull_rows(t.primary.as_ref(), "//q", &request).await.unwrap();
    assert_eq!(first, second);

    assert_eq!(first.rows.len(), 3);
    assert!(is_ordered_by_timestamp(&first.rows));
    assert!(first.replication_progress.is_at_least(last));
    assert_eq!(first.end_replication_row_indexes, BTreeMap::from([(0, 2), (1, 1)]));

    // Applying the same batch twice leaves one version per row
    for _ in 0..2 {
        t.remote
            .apply_replicated_rows("//r", &first.rows, &first.replication_progress)
            .await
            .unwrap();
    }
    let rows = t.remote.select_rows("//r", last).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        t.remote.replication_progress("//r").await.unwrap(),
        Some(first.replication_progress.clone())
    );

    // Resuming from the returned cursor yields nothing new
    let resumed = PullRowsRequest::new(first.replication_progress.clone(), t.queue)
        .with_upper_timestamp(last)
        .with_start_row_indexes(first.end_replication_row_indexes.clone());
    let next = pull_rows(t.primary.as_ref(), "//q", &resumed).await.unwrap();
    assert!(next.rows.is_empty());
    assert_eq!(next.replication_progress, first.replication_progress);
    assert_eq!(next.end_replication_row_indexes, first.end_replication_row_indexes);
}

#[tokio::test]
async fn test_upper_timestamp_bounds_pull() {
    let t = topology(CardOptions::default()).await;
    let mut stamps = Vec::new();
    for key in [1i64, 2, 3] {
        let written = t
            .client
            .insert_rows(t.card_id, vec![(RowKey::int(key), json!(key))])
            .await
            .unwrap();
        stamps.push(written.timestamp);
    }

    let request = PullRowsRequest::new(remote_progress(&t).await, t.queue).with_upper_timestamp(stamps[1]);
    let response = pull_rows(t.primary.as_ref(), "//q", &request).await.unwrap();
    assert_eq!(response.rows.len(), 2);
    assert!(response.rows.iter().all(|r| r.timestamp <= stamps[1]));
    assert_eq!(
        response.replication_progress.timestamp_at(&Key::int(3)),
        Some(stamps[1])
    );
}

// =============================================================================
// Trim
// =============================================================================

#[tokio::test]
async fn test_trim_waits_for_every_replica() {
    let t = topology(CardOptions::default()).await;
    write_rows(&t).await;

    let err = trim_rows(&t.manager, t.primary.as_ref(), t.queue, 0, 2, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ChaosError::TrimRejected { .. }));
    assert_eq!(err.category(), ErrorCategory::SafetyViolationPrevented);
    assert!(err.is_retryable());
    assert!(err.to_string().contains(&t.remote_data.to_string()));

    t.puller.pull_once().await.unwrap();
    assert_eq!(
        trim_rows(&t.manager, t.primary.as_ref(), t.queue, 0, 2, TIMEOUT).await.unwrap(),
        2
    );
    assert_eq!(
        trim_replicated_rows(&t.manager, t.primary.as_ref(), t.queue, TIMEOUT).await.unwrap(),
        1
    );

    let tablets = t.primary.describe_tablets("//q").await.unwrap();
    assert!(tablets.iter().all(|tablet| tablet.trimmed_row_count == tablet.total_row_count));
    assert_eq!(t.manager.metrics().snapshot().rows_trimmed, 3);

    // A cursor from before the trim can no longer be served
    let stale = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp::MIN), t.queue);
    let err = pull_rows(t.primary.as_ref(), "//q", &stale).await.unwrap_err();
    assert!(matches!(err, ChaosError::RowsTrimmed { .. }));
    assert_eq!(err.category(), ErrorCategory::SafetyViolationPrevented);
}

#[tokio::test]
async fn test_trim_beyond_log_is_invalid() {
    let t = topology(CardOptions::default()).await;
    write_rows(&t).await;
    t.puller.pull_once().await.unwrap();

    let err = trim_rows(&t.manager, t.primary.as_ref(), t.queue, 1, 5, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidRequest);

    let err = trim_rows(&t.manager, t.primary.as_ref(), t.remote_data, 0, 1, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidRequest);
}

#[tokio::test]
async fn test_barrier_blocks_trim_until_era_settles() {
    let t = topology(CardOptions {
        enable_replication_progress_advance_to_barrier: true,
    })
    .await;
    write_rows(&t).await;
    t.puller.pull_once().await.unwrap();
    assert_eq!(
        trim_rows(&t.manager, t.primary.as_ref(), t.queue, 0, 2, TIMEOUT).await.unwrap(),
        2
    );

    // A coordinator change moves the card to an era nobody acknowledged yet
    t.engine
        .update_coordinator_cells(&[CoordinatorCell::new(CellId::generate(), None)], &[])
        .await
        .unwrap();
    assert_eq!(t.engine.advance_card(t.card_id).await.unwrap(), Some(2));

    let err = trim_rows(&t.manager, t.primary.as_ref(), t.queue, 1, 1, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ChaosError::TrimRejected { .. }));
    assert_eq!(
        trim_replicated_rows(&t.manager, t.primary.as_ref(), t.queue, TIMEOUT).await.unwrap(),
        0
    );

    settle(&t.manager, t.card_id).await;
    assert_eq!(
        trim_rows(&t.manager, t.primary.as_ref(), t.queue, 1, 1, TIMEOUT).await.unwrap(),
        1
    );
}
