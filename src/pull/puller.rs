//! Replica puller
//!
//! Drives asynchronous replication for one replica: picks an enabled
//! upstream queue, pulls the rows the replica has not seen yet, applies
//! them to the replica table and reports the new progress to the card.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::rows::{pull_rows, PullRowsRequest};
use crate::errors::{ChaosError, ChaosResult};
use crate::manager::ChaosManager;
use crate::observability::{log_event_with_fields, log_warning, Event};
use crate::replica::TableReplica;
use crate::storage::ClusterDirectory;
use crate::timeout::with_timeout;
use crate::types::ReplicaId;

pub struct ReplicaPuller {
    manager: Arc<ChaosManager>,
    directory: Arc<ClusterDirectory>,
    replica_id: ReplicaId,
    max_rows: usize,
    timeout: Duration,
}

impl ReplicaPuller {
    pub fn new(
        manager: Arc<ChaosManager>,
        directory: Arc<ClusterDirectory>,
        replica_id: ReplicaId,
        max_rows: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            directory,
            replica_id,
            max_rows,
            timeout,
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Upstream queues in preference order: sync first, then same cluster
    fn upstream_candidates<'a>(
        replica: &TableReplica,
        replicas: impl Iterator<Item = &'a TableReplica>,
    ) -> Vec<&'a TableReplica> {
        let mut candidates: Vec<&TableReplica> = replicas
            .filter(|r| r.replica_id() != replica.replica_id() && r.is_queue() && r.is_enabled())
            .collect();
        candidates.sort_by_key(|r| {
            (
                !r.is_effective_sync_queue(),
                r.cluster_name() != replica.cluster_name(),
                r.replica_id(),
            )
        });
        candidates
    }

    /// Run one pull round
    ///
    /// Returns the number of rows applied; zero when the replica is
    /// disabled, already caught up, or no upstream could serve it.
    pub async fn pull_once(&self) -> ChaosResult<usize> {
        let card = self.manager.get_card(self.replica_id.card_id).await?;
        let replica = card.replica(self.replica_id)?;
        if !replica.is_enabled() {
            return Ok(0);
        }

        let local = self.directory.store(replica.cluster_name())?;
        let path = replica.replica_path();
        let mut cursor = replica.replication_progress().clone();
        if let Some(stored) =
            with_timeout("replication_progress", self.timeout, local.replication_progress(path)).await?
        {
            cursor.update(&stored)?;
        }

        for upstream in Self::upstream_candidates(replica, card.replicas.values()) {
            let Some(upper) = upstream
                .replication_progress()
                .min_timestamp_in(cursor.lower_key(), cursor.upper_key())
            else {
                continue;
            };
            if upper <= cursor.min_timestamp() {
                continue;
            }

            let mut request = PullRowsRequest::new(cursor.clone(), upstream.replica_id())
                .with_upper_timestamp(upper)
                .with_max_rows(self.max_rows);
            if replica.is_queue() {
                request = request.ordered();
            }

            let pulled = match self.directory.store(upstream.cluster_name()) {
                Ok(store) => {
                    with_timeout(
                        "pull_rows",
                        self.timeout,
                        pull_rows(store.as_ref(), upstream.replica_path(), &request),
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            let response = match pulled {
                Ok(response) => response,
                Err(err) => {
                    log_warning(
                        Event::RowsPulled,
                        &[
                            ("replica_id", &self.replica_id.to_string()),
                            ("upstream_replica_id", &upstream.replica_id().to_string()),
                            ("error", &err.to_string()),
                        ],
                    );
                    continue;
                }
            };

            let row_count = response.rows.len();
            with_timeout(
                "apply_replicated_rows",
                self.timeout,
                local.apply_replicated_rows(path, &response.rows, &response.replication_progress),
            )
            .await?;
            self.manager
                .update_replica_progress(self.replica_id, &response.replication_progress)
                .await?;

            let metrics = self.manager.metrics();
            metrics.add_rows_pulled(row_count as u64);
            metrics.add_rows_applied(row_count as u64);
            log_event_with_fields(
                Event::RowsApplied,
                &[
                    ("replica_id", &self.replica_id.to_string()),
                    ("upstream_replica_id", &upstream.replica_id().to_string()),
                    ("rows", &row_count.to_string()),
                    (
                        "min_timestamp",
                        &response.replication_progress.min_timestamp().to_string(),
                    ),
                ],
            );
            return Ok(row_count);
        }
        Ok(0)
    }

    /// Pull until shutdown or replica removal
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, period: Duration) {
        loop {
            let busy = match self.pull_once().await {
                Ok(rows) => rows >= self.max_rows,
                Err(ChaosError::NoSuchCard(_)) | Err(ChaosError::NoSuchReplica(_)) => break,
                Err(err) => {
                    log_warning(
                        Event::RowsPulled,
                        &[
                            ("replica_id", &self.replica_id.to_string()),
                            ("error", &err.to_string()),
                        ],
                    );
                    false
                }
            };
            if busy {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::clock::ManualClock;
    use crate::coordinator::{CoordinatorCell, CoordinatorManager, LocalCoordinatorTransport};
    use crate::era::EraEngine;
    use crate::manager::{CreateCardRequest, CreateReplicaRequest, ManagerOptions};
    use crate::observability::MetricsRegistry;
    use crate::progress::ReplicationProgress;
    use crate::replica::{ContentType, ReplicaAttributes, ReplicaMode};
    use crate::storage::{MemoryReplicaStore, ReplicaStore, RowChange, TableSchema};
    use crate::types::{CellId, RowKey, Timestamp};

    struct Fixture {
        manager: Arc<ChaosManager>,
        store: Arc<MemoryReplicaStore>,
        directory: Arc<ClusterDirectory>,
        puller: ReplicaPuller,
    }

    async fn fixture() -> Fixture {
        let manager = Arc::new(ChaosManager::new(
            Arc::new(ManualClock::new(None, Timestamp::from_parts(1, 0))),
            Arc::new(MetricsRegistry::new()),
            ManagerOptions::default(),
        ));
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        let queue = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(ReplicaAttributes::new(
                    "primary",
                    "//q",
                    ContentType::Queue,
                    ReplicaMode::Sync,
                    true,
                )),
            )
            .await
            .unwrap();
        let data = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(ReplicaAttributes::new(
                    "primary",
                    "//d",
                    ContentType::Data,
                    ReplicaMode::Async,
                    true,
                )),
            )
            .await
            .unwrap();

        let store = Arc::new(MemoryReplicaStore::new("primary"));
        store
            .create_table("//q", TableSchema::sorted(ContentType::Queue, vec![]).unwrap())
            .await
            .unwrap();
        store
            .create_table("//d", TableSchema::sorted(ContentType::Data, vec![]).unwrap())
            .await
            .unwrap();
        for ts in [10i64, 20, 30] {
            store
                .write_rows("//q", &[RowChange::write(RowKey::int(ts), json!(ts))], Timestamp(ts as u64))
                .await
                .unwrap();
        }
        manager
            .update_replica_progress(queue, &ReplicationProgress::uniform(Timestamp(30)))
            .await
            .unwrap();

        // Replicas only become enabled with the first commenced era
        let coordinators = Arc::new(CoordinatorManager::new());
        coordinators
            .update_cells(&[CoordinatorCell::new(CellId::generate(), None)], &[])
            .unwrap();
        let engine = EraEngine::new(
            Arc::clone(&manager),
            coordinators,
            Arc::new(LocalCoordinatorTransport::new()),
            Duration::from_secs(1),
        );
        assert_eq!(engine.advance_card(card_id).await.unwrap(), Some(1));

        let directory = Arc::new(ClusterDirectory::new());
        directory.register(store.clone()).unwrap();
        let puller = ReplicaPuller::new(
            Arc::clone(&manager),
            Arc::clone(&directory),
            data,
            16,
            Duration::from_secs(1),
        );
        Fixture {
            manager,
            store,
            directory,
            puller,
        }
    }

    #[tokio::test]
    async fn test_pulls_up_to_upstream_progress() {
        let f = fixture().await;
        assert_eq!(f.puller.pull_once().await.unwrap(), 3);

        let card = f.manager.get_card(f.puller.replica_id().card_id).await.unwrap();
        let progress = card.replica(f.puller.replica_id()).unwrap().replication_progress();
        assert_eq!(progress.min_timestamp(), Timestamp(30));

        let rows = f
            .store
            .lookup_rows("//d", &[RowKey::int(20)], Timestamp(30))
            .await
            .unwrap();
        assert_eq!(rows[0].as_ref().map(|r| r.value.clone()), Some(json!(20)));

        // Caught up
        assert_eq!(f.puller.pull_once().await.unwrap(), 0);
        assert_eq!(f.manager.metrics().snapshot().rows_applied, 3);
    }

    #[tokio::test]
    async fn test_disabled_replica_does_not_pull() {
        let f = fixture().await;
        let disabled = f
            .manager
            .create_replica(
                f.puller.replica_id().card_id,
                CreateReplicaRequest::new(ReplicaAttributes::new(
                    "primary",
                    "//d2",
                    ContentType::Data,
                    ReplicaMode::Async,
                    false,
                ))
                .without_catchup(),
            )
            .await
            .unwrap();
        let puller = ReplicaPuller::new(
            Arc::clone(&f.manager),
            Arc::clone(&f.directory),
            disabled,
            16,
            Duration::from_secs(1),
        );
        assert_eq!(puller.pull_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_cluster() {
        let f = fixture().await;
        f.store.set_available(false);
        assert!(f.puller.pull_once().await.is_err());

        f.store.set_available(true);
        assert_eq!(f.puller.pull_once().await.unwrap(), 3);
    }
}
