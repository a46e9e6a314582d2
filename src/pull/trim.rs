//! TrimRows
//!
//! Trimming runs under the card lock and is refused while any other
//! replica of the card has not replicated the rows about to be dropped.
//! Cards with `enable_replication_progress_advance_to_barrier` also
//! refuse to trim until the current era is settled.

use std::time::Duration;

use crate::card::ReplicationCard;
use crate::errors::{ChaosError, ChaosResult};
use crate::manager::ChaosManager;
use crate::observability::{log_event_with_fields, log_warning, Event};
use crate::storage::{ReplicaStore, TabletDescriptor};
use crate::timeout::with_timeout;
use crate::types::{Key, ReplicaId, Timestamp};

/// Lowest progress of the other replicas over `[lower, upper)`
fn replicated_by_others(
    card: &ReplicationCard,
    queue_id: ReplicaId,
    lower: &Key,
    upper: &Key,
) -> Option<(ReplicaId, Timestamp)> {
    card.replicas()
        .values()
        .filter(|r| r.replica_id() != queue_id)
        .map(|r| {
            let replicated = r
                .replication_progress()
                .min_timestamp_in(lower, upper)
                .unwrap_or(Timestamp::MIN);
            (r.replica_id(), replicated)
        })
        .min_by_key(|(_, replicated)| *replicated)
}

fn barrier_blocks(card: &ReplicationCard) -> bool {
    card.options().enable_replication_progress_advance_to_barrier && !card.is_era_settled(card.era())
}

fn queue_path(card: &ReplicationCard, replica_id: ReplicaId) -> ChaosResult<String> {
    let replica = card.replica(replica_id)?;
    if !replica.is_queue() {
        return Err(ChaosError::invalid_request(format!(
            "replica {} is not a queue and cannot be trimmed",
            replica_id
        )));
    }
    Ok(replica.replica_path().to_string())
}

async fn describe_tablet(
    store: &dyn ReplicaStore,
    path: &str,
    tablet_index: u32,
    timeout: Duration,
) -> ChaosResult<TabletDescriptor> {
    with_timeout("describe_tablets", timeout, store.describe_tablets(path))
        .await?
        .into_iter()
        .find(|t| t.tablet_index == tablet_index)
        .ok_or_else(|| ChaosError::invalid_request(format!("no tablet {} in {}", tablet_index, path)))
}

fn reject(manager: &ChaosManager, replica_id: ReplicaId, tablet_index: u32, reason: String) -> ChaosError {
    manager.metrics().increment_trims_rejected();
    log_warning(
        Event::TrimRejected,
        &[
            ("replica_id", &replica_id.to_string()),
            ("tablet_index", &tablet_index.to_string()),
            ("reason", &reason),
        ],
    );
    ChaosError::TrimRejected {
        replica_id,
        tablet_index,
        reason,
    }
}

fn record_trim(manager: &ChaosManager, replica_id: ReplicaId, tablet_index: u32, rows: u64) {
    manager.metrics().add_rows_trimmed(rows);
    log_event_with_fields(
        Event::RowsTrimmed,
        &[
            ("replica_id", &replica_id.to_string()),
            ("tablet_index", &tablet_index.to_string()),
            ("rows", &rows.to_string()),
        ],
    );
}

/// Drop the oldest rows of a queue tablet up to `trimmed_row_count`
///
/// Returns the number of rows dropped by this call.
pub async fn trim_rows(
    manager: &ChaosManager,
    store: &dyn ReplicaStore,
    replica_id: ReplicaId,
    tablet_index: u32,
    trimmed_row_count: u64,
    timeout: Duration,
) -> ChaosResult<u64> {
    let entry = manager.card_entry(replica_id.card_id)?;
    let card = entry.lock().await;
    let path = queue_path(&card, replica_id)?;

    let tablet = describe_tablet(store, &path, tablet_index, timeout).await?;
    if trimmed_row_count <= tablet.trimmed_row_count {
        return Ok(0);
    }
    if trimmed_row_count > tablet.total_row_count {
        return Err(ChaosError::invalid_request(format!(
            "cannot trim tablet {} to {} rows, it holds {} rows",
            tablet_index, trimmed_row_count, tablet.total_row_count
        )));
    }

    let rows = with_timeout(
        "read_queue",
        timeout,
        store.read_queue(&path, tablet_index, tablet.trimmed_row_count),
    )
    .await?;
    let Some(last_timestamp) = rows
        .iter()
        .take((trimmed_row_count - tablet.trimmed_row_count) as usize)
        .map(|r| r.timestamp)
        .max()
    else {
        return Ok(0);
    };

    if barrier_blocks(&card) {
        let reason = format!("era {} is not settled by every replica", card.era());
        return Err(reject(manager, replica_id, tablet_index, reason));
    }
    if let Some((lagging, replicated)) =
        replicated_by_others(&card, replica_id, &tablet.lower_key, &tablet.upper_key)
    {
        if replicated < last_timestamp {
            let reason = format!(
                "replica {} is replicated up to {} but rows up to {} would be trimmed",
                lagging, replicated, last_timestamp
            );
            return Err(reject(manager, replica_id, tablet_index, reason));
        }
    }

    let dropped = with_timeout(
        "trim_queue",
        timeout,
        store.trim_queue(&path, tablet_index, trimmed_row_count),
    )
    .await?;
    record_trim(manager, replica_id, tablet_index, dropped);
    Ok(dropped)
}

/// Trim every tablet of a queue up to what all other replicas replicated
///
/// Returns the total number of rows dropped.
pub async fn trim_replicated_rows(
    manager: &ChaosManager,
    store: &dyn ReplicaStore,
    replica_id: ReplicaId,
    timeout: Duration,
) -> ChaosResult<u64> {
    let entry = manager.card_entry(replica_id.card_id)?;
    let card = entry.lock().await;
    let path = queue_path(&card, replica_id)?;
    if barrier_blocks(&card) {
        return Ok(0);
    }

    let tablets = with_timeout("describe_tablets", timeout, store.describe_tablets(&path)).await?;
    let mut total = 0;
    for tablet in tablets {
        let Some((_, safe)) =
            replicated_by_others(&card, replica_id, &tablet.lower_key, &tablet.upper_key)
        else {
            continue;
        };
        let rows = with_timeout(
            "read_queue",
            timeout,
            store.read_queue(&path, tablet.tablet_index, tablet.trimmed_row_count),
        )
        .await?;
        let prefix = rows.iter().take_while(|r| r.timestamp <= safe).count() as u64;
        if prefix == 0 {
            continue;
        }

        let dropped = with_timeout(
            "trim_queue",
            timeout,
            store.trim_queue(&path, tablet.tablet_index, tablet.trimmed_row_count + prefix),
        )
        .await?;
        record_trim(manager, replica_id, tablet.tablet_index, dropped);
        total += dropped;
    }
    Ok(total)
}
