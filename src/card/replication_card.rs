//! Replication card

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::shortcut::ShortcutState;
use super::snapshot::CardSnapshot;
use crate::errors::{ChaosError, ChaosResult};
use crate::progress::ReplicationProgress;
use crate::replica::{ReplicaMode, ReplicaState, TableReplica};
use crate::types::{CardId, CellId, ClockTag, Era, ReplicaId, TableId, Timestamp, INITIAL_ERA};

/// Per-card behaviour switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardOptions {
    /// Trimming additionally requires every replica to have settled the
    /// current era
    #[serde(default)]
    pub enable_replication_progress_advance_to_barrier: bool,
}

/// Replication card
///
/// Owned by the card registry and only mutated under the card lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCard {
    card_id: CardId,
    era: Era,
    replicas: BTreeMap<ReplicaId, TableReplica>,
    coordinators: BTreeMap<CellId, ShortcutState>,
    current_replica_index: u32,
    #[serde(default)]
    table_id: Option<TableId>,
    #[serde(default)]
    table_path: Option<String>,
    #[serde(default)]
    table_cluster_name: Option<String>,
    #[serde(default)]
    clock_tag: Option<ClockTag>,
    #[serde(default)]
    options: CardOptions,
    /// Coordinator set changed; the next era must regrant shortcuts
    #[serde(default)]
    coordinator_change_pending: bool,
    #[serde(default)]
    last_write_timestamp: Timestamp,
}

impl ReplicationCard {
    pub fn new(card_id: CardId, clock_tag: Option<ClockTag>, options: CardOptions) -> Self {
        Self {
            card_id,
            era: INITIAL_ERA,
            replicas: BTreeMap::new(),
            coordinators: BTreeMap::new(),
            current_replica_index: 0,
            table_id: None,
            table_path: None,
            table_cluster_name: None,
            clock_tag,
            options,
            coordinator_change_pending: false,
            last_write_timestamp: Timestamp::MIN,
        }
    }

    pub fn with_table(
        mut self,
        table_id: Option<TableId>,
        table_path: Option<String>,
        table_cluster_name: Option<String>,
    ) -> Self {
        self.table_id = table_id;
        self.table_path = table_path;
        self.table_cluster_name = table_cluster_name;
        self
    }

    pub fn card_id(&self) -> CardId {
        self.card_id
    }

    pub fn era(&self) -> Era {
        self.era
    }

    pub fn clock_tag(&self) -> Option<ClockTag> {
        self.clock_tag
    }

    pub fn options(&self) -> &CardOptions {
        &self.options
    }

    pub fn table_id(&self) -> Option<TableId> {
        self.table_id
    }

    pub fn table_path(&self) -> Option<&str> {
        self.table_path.as_deref()
    }

    pub fn table_cluster_name(&self) -> Option<&str> {
        self.table_cluster_name.as_deref()
    }

    pub fn replicas(&self) -> &BTreeMap<ReplicaId, TableReplica> {
        &self.replicas
    }

    pub fn replica(&self, replica_id: ReplicaId) -> ChaosResult<&TableReplica> {
        self.replicas
            .get(&replica_id)
            .ok_or(ChaosError::NoSuchReplica(replica_id))
    }

    pub fn replica_mut(&mut self, replica_id: ReplicaId) -> ChaosResult<&mut TableReplica> {
        self.replicas
            .get_mut(&replica_id)
            .ok_or(ChaosError::NoSuchReplica(replica_id))
    }

    pub fn replicas_mut(&mut self) -> impl Iterator<Item = &mut TableReplica> {
        self.replicas.values_mut()
    }

    pub fn find_replica_by_path(&self, cluster_name: &str, replica_path: &str) -> Option<&TableReplica> {
        self.replicas
            .values()
            .find(|r| r.cluster_name() == cluster_name && r.replica_path() == replica_path)
    }

    /// Next free replica id; indexes wrap around and skip ones in use
    pub fn generate_replica_id(&mut self) -> ReplicaId {
        loop {
            let replica_id = ReplicaId::new(self.card_id, self.current_replica_index);
            self.current_replica_index = self.current_replica_index.wrapping_add(1);
            if !self.replicas.contains_key(&replica_id) {
                return replica_id;
            }
        }
    }

    pub fn insert_replica(&mut self, replica: TableReplica) {
        self.replicas.insert(replica.replica_id(), replica);
    }

    /// Remove a disabled replica
    pub fn remove_replica(&mut self, replica_id: ReplicaId) -> ChaosResult<TableReplica> {
        let replica = self.replica(replica_id)?;
        if replica.state() != ReplicaState::Disabled {
            return Err(ChaosError::ReplicaNotDisabled(replica_id));
        }
        self.replicas
            .remove(&replica_id)
            .ok_or(ChaosError::NoSuchReplica(replica_id))
    }

    /// Whether some replica waits for the next era
    pub fn is_transitioning(&self) -> bool {
        self.replicas.values().any(|r| r.is_transitioning())
    }

    /// Whether the card must move to a new era
    pub fn needs_new_era(&self) -> bool {
        self.coordinator_change_pending || self.is_transitioning()
    }

    pub fn mark_coordinator_change(&mut self) {
        self.coordinator_change_pending = true;
    }

    pub fn coordinator_change_pending(&self) -> bool {
        self.coordinator_change_pending
    }

    /// Whether a sync enabled queue exists once pending transitions finish
    pub fn has_sync_queue_after_commence(&self) -> bool {
        self.replicas.values().any(|r| {
            r.is_queue()
                && r.mode().stable_target() == ReplicaMode::Sync
                && r.state().stable_target() == ReplicaState::Enabled
        })
    }

    pub fn coordinators(&self) -> &BTreeMap<CellId, ShortcutState> {
        &self.coordinators
    }

    pub fn shortcut(&self, cell_id: CellId) -> Option<ShortcutState> {
        self.coordinators.get(&cell_id).copied()
    }

    /// Cells holding a granted shortcut
    pub fn coordinator_cell_ids(&self) -> Vec<CellId> {
        self.coordinators
            .iter()
            .filter(|(_, state)| **state == ShortcutState::Granted)
            .map(|(cell_id, _)| *cell_id)
            .collect()
    }

    /// Move every shortcut to `Revoking` and return the cells to revoke
    pub fn begin_revoke(&mut self) -> Vec<CellId> {
        for state in self.coordinators.values_mut() {
            *state = ShortcutState::Revoking;
        }
        self.coordinators.keys().copied().collect()
    }

    /// Drop a revoked shortcut; returns false if it was not being revoked
    pub fn finish_revoke(&mut self, cell_id: CellId) -> bool {
        if self.coordinators.get(&cell_id) == Some(&ShortcutState::Revoking) {
            self.coordinators.remove(&cell_id);
            true
        } else {
            false
        }
    }

    /// Mark a granting shortcut as granted; returns false otherwise
    pub fn finish_grant(&mut self, cell_id: CellId) -> bool {
        match self.coordinators.get_mut(&cell_id) {
            Some(state) if *state == ShortcutState::Granting => {
                *state = ShortcutState::Granted;
                true
            }
            _ => false,
        }
    }

    /// Cells whose grant has not been confirmed yet
    pub fn granting_cell_ids(&self) -> Vec<CellId> {
        self.coordinators
            .iter()
            .filter(|(_, state)| **state == ShortcutState::Granting)
            .map(|(cell_id, _)| *cell_id)
            .collect()
    }

    /// Commence the next era at `timestamp`
    ///
    /// Requires every shortcut to be revoked and a sync queue to exist in
    /// the new era. Pending transitions become final and shortcuts start
    /// granting to `coordinator_cell_ids`.
    pub fn commence_new_era(
        &mut self,
        timestamp: Timestamp,
        coordinator_cell_ids: &[CellId],
    ) -> ChaosResult<Era> {
        if !self.coordinators.is_empty() {
            return Err(ChaosError::Internal(format!(
                "cannot commence new era for card {} while {} shortcuts are not revoked",
                self.card_id,
                self.coordinators.len()
            )));
        }
        if !self.has_sync_queue_after_commence() {
            return Err(ChaosError::NoSyncQueue(self.card_id));
        }

        let era = self.era + 1;
        for replica in self.replicas.values_mut() {
            replica.commence_era(era, timestamp);
        }
        self.era = era;
        self.coordinator_change_pending = false;
        for cell_id in coordinator_cell_ids {
            self.coordinators.insert(*cell_id, ShortcutState::Granting);
        }
        Ok(era)
    }

    /// Era every tablet of every replica has acknowledged
    pub fn settled_era(&self) -> Option<Era> {
        self.replicas
            .values()
            .map(|r| r.settled_era())
            .collect::<Option<Vec<Era>>>()
            .map(|eras| eras.into_iter().min().unwrap_or(self.era))
    }

    /// Whether every replica has settled `era`
    pub fn is_era_settled(&self, era: Era) -> bool {
        self.settled_era().map_or(false, |settled| settled >= era)
    }

    pub fn last_write_timestamp(&self) -> Timestamp {
        self.last_write_timestamp
    }

    pub fn record_write(&mut self, timestamp: Timestamp) {
        self.last_write_timestamp = self.last_write_timestamp.max(timestamp);
    }

    /// Pointwise maximum progress of all enabled replicas
    pub fn known_progress(&self) -> Option<ReplicationProgress> {
        let mut enabled = self.replicas.values().filter(|r| r.is_enabled());
        let mut union = enabled.next()?.replication_progress().clone();
        for replica in enabled {
            // Both progresses are validated on the way into the card.
            if union.update(replica.replication_progress()).is_err() {
                return None;
            }
        }
        Some(union)
    }

    /// Whether some replica still lags at or behind `progress`
    ///
    /// Queues keep rows until every replica has replicated them, so such a
    /// replica guarantees the backlog after `progress` is still available.
    pub fn has_waiting_replica(&self, progress: &ReplicationProgress) -> bool {
        self.replicas.values().any(|r| {
            !r.history().is_empty() && progress.is_greater_or_equal(r.replication_progress())
        })
    }

    /// Lag of each replica behind `latest` in milliseconds
    pub fn replica_lag_times(&self, latest: Timestamp) -> Vec<(ReplicaId, u64)> {
        self.replicas
            .values()
            .map(|r| {
                let progress = r.replication_progress().min_timestamp();
                (r.replica_id(), progress.millis_until(latest))
            })
            .collect()
    }

    /// Immutable view of the card at its current era
    pub fn snapshot(&self) -> CardSnapshot {
        CardSnapshot::from_card(self)
    }
}
