//! Read and write entry points
//!
//! Writes run under the card lock so the card sees them in timestamp
//! order. Each write goes through a coordinator holding a granted
//! shortcut and reaches every replica whose settled write mode is direct
//! plus every settled sync queue. Everything else catches up by pull.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::in_sync::{get_in_sync_replicas, is_in_sync};
use super::transaction::Transaction;
use crate::card::{CardSnapshot, ReplicationCard, ShortcutState};
use crate::clock::TimestampProvider;
use crate::errors::{ChaosError, ChaosResult};
use crate::manager::ChaosManager;
use crate::observability::{log_event_with_fields, log_warning, Event};
use crate::replica::{TableReplica, WriteMode};
use crate::storage::{ClusterDirectory, Row};
use crate::timeout::with_timeout;
use crate::types::{CardId, CellId, ReplicaId, RowKey, Timestamp};

/// Which replicas a read may be served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaConsistency {
    /// Any enabled data replica, preferring in-sync ones
    #[default]
    None,
    /// Only replicas in sync at the read timestamp
    Sync,
}

/// Result of a committed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub timestamp: Timestamp,
    pub coordinator: CellId,
    /// Replicas written directly
    pub replica_ids: Vec<ReplicaId>,
}

struct WriteTarget {
    replica_id: ReplicaId,
    cluster_name: String,
    replica_path: String,
    is_queue: bool,
}

impl WriteTarget {
    fn of(replica: &TableReplica) -> Self {
        Self {
            replica_id: replica.replica_id(),
            cluster_name: replica.cluster_name().to_string(),
            replica_path: replica.replica_path().to_string(),
            is_queue: replica.is_queue(),
        }
    }
}

pub struct ChaosClient {
    manager: Arc<ChaosManager>,
    directory: Arc<ClusterDirectory>,
    clock: Arc<dyn TimestampProvider>,
    timeout: Duration,
}

impl ChaosClient {
    /// Client using the cell clock
    pub fn new(manager: Arc<ChaosManager>, directory: Arc<ClusterDirectory>, timeout: Duration) -> Self {
        let clock = Arc::clone(manager.clock());
        Self {
            manager,
            directory,
            clock,
            timeout,
        }
    }

    /// Use another clock authority for new transactions
    pub fn with_clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = clock;
        self
    }

    pub fn start_transaction(&self) -> Transaction {
        Transaction::start(self.clock.as_ref())
    }

    // ===== WRITES =====

    pub async fn insert_rows(&self, card_id: CardId, rows: Vec<(RowKey, Value)>) -> ChaosResult<WriteResult> {
        let tx = rows
            .into_iter()
            .fold(self.start_transaction(), |tx, (key, value)| tx.write(key, value));
        self.commit(card_id, tx).await
    }

    pub async fn delete_rows(&self, card_id: CardId, keys: Vec<RowKey>) -> ChaosResult<WriteResult> {
        let tx = keys
            .into_iter()
            .fold(self.start_transaction(), |tx, key| tx.delete(key));
        self.commit(card_id, tx).await
    }

    /// Commit a transaction to the replicas of a card
    pub async fn commit(&self, card_id: CardId, tx: Transaction) -> ChaosResult<WriteResult> {
        let result = self.commit_locked(card_id, &tx).await;
        let metrics = self.manager.metrics();
        match &result {
            Ok(written) => {
                metrics.increment_writes();
                log_event_with_fields(
                    Event::WriteCommitted,
                    &[
                        ("card_id", &card_id.to_string()),
                        ("timestamp", &written.timestamp.to_string()),
                        ("coordinator", &written.coordinator.to_string()),
                        ("replicas", &written.replica_ids.len().to_string()),
                        ("rows", &tx.changes.len().to_string()),
                    ],
                );
            }
            Err(err) => {
                metrics.increment_writes_rejected();
                log_warning(
                    Event::WriteRejected,
                    &[
                        ("card_id", &card_id.to_string()),
                        ("timestamp", &tx.timestamp.to_string()),
                        ("error", &err.to_string()),
                    ],
                );
            }
        }
        result
    }

    async fn commit_locked(&self, card_id: CardId, tx: &Transaction) -> ChaosResult<WriteResult> {
        if tx.is_empty() {
            return Err(ChaosError::invalid_request("transaction has no changes"));
        }
        let entry = self.manager.card_entry(card_id)?;
        let mut card = entry.lock().await;

        check_clock(&card, tx)?;
        if tx.timestamp <= card.last_write_timestamp() {
            return Err(ChaosError::StaleTimestamp {
                timestamp: tx.timestamp,
                last_write: card.last_write_timestamp(),
            });
        }
        let coordinator = pick_coordinator(&card)?;
        let mut targets: Vec<WriteTarget> = card
            .replicas()
            .values()
            .filter(|r| {
                (r.is_data() && r.effective_write_mode() == WriteMode::Direct)
                    || r.is_effective_sync_queue()
            })
            .map(WriteTarget::of)
            .collect();
        if !targets.iter().any(|t| t.is_queue) {
            return Err(ChaosError::NoSyncQueue(card_id));
        }
        // Queues first: a row no queue holds must not reach any data replica
        targets.sort_by_key(|t| (!t.is_queue, t.replica_id));

        let mut written = Vec::with_capacity(targets.len());
        let mut failure = None;
        for target in &targets {
            let result = match self.directory.store(&target.cluster_name) {
                Ok(store) => {
                    with_timeout(
                        "write_rows",
                        self.timeout,
                        store.write_rows(&target.replica_path, &tx.changes, tx.timestamp),
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => written.push(target.replica_id),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let queue_written = targets
            .iter()
            .any(|t| t.is_queue && written.contains(&t.replica_id));
        if !queue_written {
            return Err(failure.unwrap_or(ChaosError::NoSyncQueue(card_id)));
        }

        // The row is in a queue now. Direct replicas that missed it stop
        // counting as caught up and have to pull it.
        let last_write = card.last_write_timestamp();
        for replica in card.replicas_mut() {
            let is_target = written.contains(&replica.replica_id());
            replica.record_write_target(is_target, last_write, tx.timestamp);
        }
        card.record_write(tx.timestamp);
        entry.publish(&card);

        if let Some(err) = failure {
            return Err(err);
        }
        Ok(WriteResult {
            timestamp: tx.timestamp,
            coordinator,
            replica_ids: written,
        })
    }

    // ===== READS =====

    /// Versioned point lookups at `timestamp`
    pub async fn lookup_rows(
        &self,
        card_id: CardId,
        keys: &[RowKey],
        timestamp: Timestamp,
        consistency: ReplicaConsistency,
    ) -> ChaosResult<Vec<Option<Row>>> {
        let card = self.manager.get_card(card_id).await?;
        let mut last_error = None;
        for replica in read_candidates(&card, Some(keys), timestamp, consistency)? {
            let read = match self.directory.store(replica.cluster_name()) {
                Ok(store) => {
                    with_timeout(
                        "lookup_rows",
                        self.timeout,
                        store.lookup_rows(replica.replica_path(), keys, timestamp),
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            match read {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_retryable() => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(ChaosError::NoInSyncReplicas(card_id)))
    }

    /// Versioned full scan at `timestamp`
    pub async fn select_rows(
        &self,
        card_id: CardId,
        timestamp: Timestamp,
        consistency: ReplicaConsistency,
    ) -> ChaosResult<Vec<Row>> {
        let card = self.manager.get_card(card_id).await?;
        let mut last_error = None;
        for replica in read_candidates(&card, None, timestamp, consistency)? {
            let read = match self.directory.store(replica.cluster_name()) {
                Ok(store) => {
                    with_timeout(
                        "select_rows",
                        self.timeout,
                        store.select_rows(replica.replica_path(), timestamp),
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            match read {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_retryable() => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(ChaosError::NoInSyncReplicas(card_id)))
    }

    pub async fn get_in_sync_replicas(
        &self,
        card_id: CardId,
        keys: Option<&[RowKey]>,
        timestamp: Timestamp,
    ) -> ChaosResult<Vec<ReplicaId>> {
        let card = self.manager.get_card(card_id).await?;
        Ok(get_in_sync_replicas(&card, keys, timestamp))
    }
}

fn check_clock(card: &ReplicationCard, tx: &Transaction) -> ChaosResult<()> {
    match card.clock_tag() {
        Some(expected) if tx.clock_tag != Some(expected) => Err(ChaosError::ClockMismatch {
            expected: Some(expected),
            actual: tx.clock_tag,
        }),
        _ => Ok(()),
    }
}

fn pick_coordinator(card: &ReplicationCard) -> ChaosResult<CellId> {
    let granted: Vec<CellId> = card
        .coordinators()
        .iter()
        .filter(|(_, state)| **state == ShortcutState::Granted)
        .map(|(cell_id, _)| *cell_id)
        .collect();
    granted
        .choose(&mut rand::thread_rng())
        .copied()
        .ok_or(ChaosError::NoCoordinator(card.card_id()))
}

/// Data replicas to read from, best first
fn read_candidates<'a>(
    card: &'a CardSnapshot,
    keys: Option<&[RowKey]>,
    timestamp: Timestamp,
    consistency: ReplicaConsistency,
) -> ChaosResult<Vec<&'a TableReplica>> {
    let mut candidates: Vec<(&TableReplica, bool)> = card
        .replicas
        .values()
        .filter(|r| r.is_data() && r.is_enabled())
        .map(|r| (r, is_in_sync(r, keys, timestamp)))
        .filter(|(_, in_sync)| *in_sync || consistency == ReplicaConsistency::None)
        .collect();
    if candidates.is_empty() {
        return Err(ChaosError::NoInSyncReplicas(card.card_id));
    }
    // In-sync replicas first
    candidates.sort_by_key(|(r, in_sync)| (!*in_sync, r.replica_id()));
    Ok(candidates.into_iter().map(|(r, _)| r).collect())
}
