//! Table replica state machine
//!
//! Alter requests move a replica into a transitional mode or state. The
//! transition is finished by `commence_era`, which records the new
//! configuration in the replica history. Tablets acknowledge eras
//! independently; the replica is settled at the lowest acknowledged era.

use serde::{Deserialize, Serialize};

use super::history::{find_index_by_era, find_index_by_timestamp, ReplicaHistoryItem};
use super::mode::{write_mode, ContentType, ReplicaMode, ReplicaState, WriteMode};
use crate::errors::{ChaosError, ChaosResult};
use crate::progress::ReplicationProgress;
use crate::types::{Era, Key, ReplicaId, Timestamp, INITIAL_ERA};

/// Attributes supplied when creating a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaAttributes {
    pub cluster_name: String,
    pub replica_path: String,
    pub content_type: ContentType,
    pub mode: ReplicaMode,
    pub enabled: bool,
    #[serde(default = "default_tablet_count")]
    pub tablet_count: u32,
}

fn default_tablet_count() -> u32 {
    1
}

impl ReplicaAttributes {
    pub fn new(
        cluster_name: impl Into<String>,
        replica_path: impl Into<String>,
        content_type: ContentType,
        mode: ReplicaMode,
        enabled: bool,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            replica_path: replica_path.into(),
            content_type,
            mode,
            enabled,
            tablet_count: default_tablet_count(),
        }
    }

    pub fn with_tablet_count(mut self, tablet_count: u32) -> Self {
        self.tablet_count = tablet_count;
        self
    }
}

/// Requested change of mode and/or state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterReplicaRequest {
    #[serde(default)]
    pub mode: Option<ReplicaMode>,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Card era the request was built against
    #[serde(default)]
    pub expected_era: Option<Era>,
}

impl AlterReplicaRequest {
    pub fn mode(mode: ReplicaMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub fn with_expected_era(mut self, era: Era) -> Self {
        self.expected_era = Some(era);
        self
    }

    /// Request expressed as a target state
    pub fn state(state: ReplicaState) -> ChaosResult<Self> {
        match state {
            ReplicaState::Enabled => Ok(Self::enabled(true)),
            ReplicaState::Disabled => Ok(Self::enabled(false)),
            other => Err(ChaosError::invalid_request(format!(
                "Invalid replica state {}",
                other
            ))),
        }
    }
}

/// One replica of a replication card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReplica {
    replica_id: ReplicaId,
    cluster_name: String,
    replica_path: String,
    content_type: ContentType,
    mode: ReplicaMode,
    state: ReplicaState,
    replication_progress: ReplicationProgress,
    history: Vec<ReplicaHistoryItem>,
    /// Highest era acknowledged by each tablet
    tablet_eras: Vec<Option<Era>>,
    /// First timestamp from which every write reached this replica directly
    #[serde(default)]
    direct_since: Option<Timestamp>,
}

impl TableReplica {
    /// Create a replica joining a card at `era`
    ///
    /// Enabled replicas start in `Enabling` and only become `Enabled` when
    /// the next era is commenced. The initial history item records the
    /// configuration in force from `start_timestamp`.
    pub fn create(
        replica_id: ReplicaId,
        attributes: ReplicaAttributes,
        era: Era,
        replication_progress: ReplicationProgress,
        start_timestamp: Timestamp,
    ) -> ChaosResult<Self> {
        if !attributes.mode.is_stable() {
            return Err(ChaosError::invalid_request(format!(
                "Invalid replica mode {}",
                attributes.mode
            )));
        }
        if attributes.tablet_count == 0 {
            return Err(ChaosError::invalid_request(
                "replica must have at least one tablet",
            ));
        }
        replication_progress.validate()?;

        let state = if attributes.enabled {
            ReplicaState::Enabling
        } else {
            ReplicaState::Disabled
        };
        let initial_state = if attributes.enabled && era == INITIAL_ERA {
            ReplicaState::Enabled
        } else {
            ReplicaState::Disabled
        };

        Ok(Self {
            replica_id,
            cluster_name: attributes.cluster_name,
            replica_path: attributes.replica_path,
            content_type: attributes.content_type,
            mode: attributes.mode,
            state,
            replication_progress,
            history: vec![ReplicaHistoryItem::new(
                era,
                start_timestamp,
                attributes.mode,
                initial_state,
            )],
            tablet_eras: vec![None; attributes.tablet_count as usize],
            direct_since: None,
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn replica_path(&self) -> &str {
        &self.replica_path
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn mode(&self) -> ReplicaMode {
        self.mode
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn history(&self) -> &[ReplicaHistoryItem] {
        &self.history
    }

    pub fn replication_progress(&self) -> &ReplicationProgress {
        &self.replication_progress
    }

    pub fn tablet_count(&self) -> u32 {
        self.tablet_eras.len() as u32
    }

    pub fn is_queue(&self) -> bool {
        self.content_type == ContentType::Queue
    }

    pub fn is_data(&self) -> bool {
        self.content_type == ContentType::Data
    }

    /// Whether a mode or state change is waiting for the next era
    pub fn is_transitioning(&self) -> bool {
        !self.mode.is_stable() || !self.state.is_stable()
    }

    /// Write mode derived from the live configuration
    pub fn write_mode(&self) -> WriteMode {
        write_mode(self.content_type, self.mode, self.state)
    }

    /// Whether the replica currently consumes rows from queues
    pub fn is_enabled(&self) -> bool {
        self.state.stable_previous() == ReplicaState::Enabled
    }

    /// Validate and apply an alter request
    ///
    /// Returns whether anything changed and the card must move to a new era.
    pub fn alter(&mut self, request: &AlterReplicaRequest) -> ChaosResult<bool> {
        if let Some(mode) = request.mode {
            if !mode.is_stable() {
                return Err(ChaosError::invalid_request(format!(
                    "Invalid replica mode {}",
                    mode
                )));
            }
            if !self.mode.is_stable() {
                return Err(ChaosError::ModeTransitioning(self.replica_id));
            }
        }
        if request.enabled.is_some() && !self.state.is_stable() {
            return Err(ChaosError::StateTransitioning(self.replica_id));
        }

        let mut changed = false;
        match (request.mode, self.mode) {
            (Some(ReplicaMode::Async), ReplicaMode::Sync) => {
                self.mode = ReplicaMode::SyncToAsync;
                changed = true;
            }
            (Some(ReplicaMode::Sync), ReplicaMode::Async) => {
                self.mode = ReplicaMode::AsyncToSync;
                changed = true;
            }
            _ => {}
        }
        match (request.enabled, self.state) {
            (Some(true), ReplicaState::Disabled) => {
                self.state = ReplicaState::Enabling;
                changed = true;
            }
            (Some(false), ReplicaState::Enabled) => {
                self.state = ReplicaState::Disabling;
                changed = true;
            }
            _ => {}
        }
        Ok(changed)
    }

    /// Finish pending transitions as part of era `era` starting at `timestamp`
    ///
    /// Returns whether the replica changed and a history item was recorded.
    pub fn commence_era(&mut self, era: Era, timestamp: Timestamp) -> bool {
        let mut updated = false;
        if !self.mode.is_stable() {
            self.mode = self.mode.stable_target();
            updated = true;
        }
        if !self.state.is_stable() {
            self.state = self.state.stable_target();
            updated = true;
        }
        if updated {
            self.history.push(ReplicaHistoryItem::new(
                era, timestamp, self.mode, self.state,
            ));
        }
        updated
    }

    /// History item in force at `timestamp`
    pub fn history_item_at(&self, timestamp: Timestamp) -> Option<&ReplicaHistoryItem> {
        find_index_by_timestamp(&self.history, timestamp).map(|i| &self.history[i])
    }

    /// History item in force at `era`
    pub fn history_item_for_era(&self, era: Era) -> Option<&ReplicaHistoryItem> {
        find_index_by_era(&self.history, era).map(|i| &self.history[i])
    }

    /// Drop history items that precede the one in force at `retain_timestamp`
    pub fn remove_history_before(&mut self, retain_timestamp: Timestamp) -> usize {
        match find_index_by_timestamp(&self.history, retain_timestamp) {
            Some(index) if index > 0 => {
                self.history.drain(..index);
                index
            }
            _ => 0,
        }
    }

    /// Record that `tablet_index` has observed `era`
    pub fn acknowledge_era(&mut self, tablet_index: u32, era: Era) -> ChaosResult<()> {
        let slot = self
            .tablet_eras
            .get_mut(tablet_index as usize)
            .ok_or_else(|| {
                ChaosError::invalid_request(format!(
                    "tablet index {} is out of range for replica {}",
                    tablet_index, self.replica_id
                ))
            })?;
        *slot = Some(slot.map_or(era, |known| known.max(era)));
        Ok(())
    }

    /// Era every tablet has acknowledged, if all have acknowledged one
    pub fn settled_era(&self) -> Option<Era> {
        self.tablet_eras
            .iter()
            .copied()
            .collect::<Option<Vec<Era>>>()
            .and_then(|eras| eras.into_iter().min())
    }

    pub fn tablet_eras(&self) -> &[Option<Era>] {
        &self.tablet_eras
    }

    /// Mode and state every tablet agrees on
    ///
    /// `None` while some tablet has not acknowledged any era yet.
    pub fn settled_mode_state(&self) -> Option<(ReplicaMode, ReplicaState)> {
        let era = self.settled_era()?;
        Some(match self.history_item_for_era(era) {
            Some(item) => (item.mode, item.state),
            None => (self.mode.stable_previous(), self.state.stable_previous()),
        })
    }

    /// Write mode writers must use for this replica
    pub fn effective_write_mode(&self) -> WriteMode {
        match self.settled_mode_state() {
            Some((mode, state)) => write_mode(self.content_type, mode, state),
            None => WriteMode::Pull,
        }
    }

    /// Whether writers append the change log to this replica
    pub fn is_effective_sync_queue(&self) -> bool {
        self.is_queue()
            && self.settled_mode_state() == Some((ReplicaMode::Sync, ReplicaState::Enabled))
    }

    /// Resize the tablet set; new tablets have not acknowledged any era
    pub fn set_tablet_count(&mut self, tablet_count: u32) -> ChaosResult<()> {
        if tablet_count == 0 {
            return Err(ChaosError::invalid_request(
                "replica must have at least one tablet",
            ));
        }
        self.tablet_eras.resize(tablet_count as usize, None);
        Ok(())
    }

    /// Merge reported progress into the replica progress
    pub fn update_progress(&mut self, progress: &ReplicationProgress) -> ChaosResult<()> {
        self.replication_progress.update(progress)
    }

    /// Advance the replica progress over `[lower, upper)`
    pub fn advance_progress(
        &mut self,
        lower: &Key,
        upper: &Key,
        timestamp: Timestamp,
    ) -> ChaosResult<()> {
        self.replication_progress.advance(lower, upper, timestamp)
    }

    /// Split the replica progress at the pivot keys of a new partitioning
    pub fn reshape_progress(&mut self, pivots: &[Key]) {
        self.replication_progress.reshape(pivots);
    }

    pub fn direct_since(&self) -> Option<Timestamp> {
        self.direct_since
    }

    /// Track whether this replica is a direct write target
    ///
    /// On the first write routed to it directly, every earlier write up to
    /// `last_write` must still arrive by pull. Once the progress has
    /// passed that point, direct writes advance the progress.
    pub fn record_write_target(&mut self, is_target: bool, last_write: Timestamp, write: Timestamp) {
        if !is_target {
            self.direct_since = None;
            return;
        }
        let since = *self.direct_since.get_or_insert(last_write.next());
        if self.replication_progress.min_timestamp() >= since.prev() {
            self.replication_progress.advance_all(write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CardId;

    fn replica(content_type: ContentType, mode: ReplicaMode, enabled: bool, era: Era) -> TableReplica {
        TableReplica::create(
            ReplicaId::new(CardId::generate(), 0),
            ReplicaAttributes::new("primary", "//t", content_type, mode, enabled),
            era,
            ReplicationProgress::uniform(Timestamp::MIN),
            Timestamp::MIN,
        )
        .unwrap()
    }

    #[test]
    fn test_enabled_replica_starts_enabling() {
        let r = replica(ContentType::Data, ReplicaMode::Sync, true, 3);
        assert_eq!(r.state(), ReplicaState::Enabling);
        assert_eq!(r.history().len(), 1);
        assert_eq!(r.history()[0].state, ReplicaState::Disabled);
        assert_eq!(r.write_mode(), WriteMode::Pull);
    }

    #[test]
    fn test_rejects_transitional_mode_on_create() {
        let result = TableReplica::create(
            ReplicaId::new(CardId::generate(), 0),
            ReplicaAttributes::new("c", "//t", ContentType::Data, ReplicaMode::SyncToAsync, true),
            0,
            ReplicationProgress::uniform(Timestamp::MIN),
            Timestamp::MIN,
        );
        assert!(matches!(result, Err(ChaosError::InvalidRequest(_))));
    }

    #[test]
    fn test_alter_enters_transition() {
        let mut r = replica(ContentType::Data, ReplicaMode::Sync, false, 0);
        assert!(r.alter(&AlterReplicaRequest::mode(ReplicaMode::Async)).unwrap());
        assert_eq!(r.mode(), ReplicaMode::SyncToAsync);
        assert!(r.is_transitioning());
    }

    #[test]
    fn test_alter_while_transitioning_fails() {
        let mut r = replica(ContentType::Data, ReplicaMode::Sync, false, 0);
        r.alter(&AlterReplicaRequest::mode(ReplicaMode::Async)).unwrap();
        let err = r
            .alter(&AlterReplicaRequest::mode(ReplicaMode::Sync))
            .unwrap_err();
        assert!(matches!(err, ChaosError::ModeTransitioning(_)));
        assert!(err.is_retryable());

        let mut r = replica(ContentType::Data, ReplicaMode::Sync, true, 0);
        let err = r.alter(&AlterReplicaRequest::enabled(false)).unwrap_err();
        assert!(matches!(err, ChaosError::StateTransitioning(_)));
    }

    #[test]
    fn test_alter_to_same_value_is_noop() {
        let mut r = replica(ContentType::Queue, ReplicaMode::Async, false, 0);
        assert!(!r.alter(&AlterReplicaRequest::mode(ReplicaMode::Async)).unwrap());
        assert!(!r.alter(&AlterReplicaRequest::enabled(false)).unwrap());
    }

    #[test]
    fn test_commence_era_finishes_transition() {
        let mut r = replica(ContentType::Data, ReplicaMode::Async, true, 0);
        r.alter(&AlterReplicaRequest::mode(ReplicaMode::Sync)).unwrap();
        assert!(r.commence_era(1, Timestamp(100)));

        assert_eq!(r.mode(), ReplicaMode::Sync);
        assert_eq!(r.state(), ReplicaState::Enabled);
        let last = r.history().last().unwrap();
        assert_eq!(last.era, 1);
        assert_eq!(last.timestamp, Timestamp(100));
        assert!(!r.commence_era(2, Timestamp(200)));
    }

    #[test]
    fn test_settlement_waits_for_every_tablet() {
        let mut r = TableReplica::create(
            ReplicaId::new(CardId::generate(), 0),
            ReplicaAttributes::new("c", "//t", ContentType::Data, ReplicaMode::Sync, true)
                .with_tablet_count(2),
            0,
            ReplicationProgress::uniform(Timestamp::MIN),
            Timestamp::MIN,
        )
        .unwrap();
        r.commence_era(1, Timestamp(10));

        r.acknowledge_era(0, 1).unwrap();
        assert_eq!(r.settled_era(), None);
        assert_eq!(r.effective_write_mode(), WriteMode::Pull);

        r.acknowledge_era(1, 1).unwrap();
        assert_eq!(r.settled_era(), Some(1));
        assert_eq!(r.effective_write_mode(), WriteMode::Direct);
        assert!(r.acknowledge_era(2, 1).is_err());
    }

    #[test]
    fn test_history_expiry_keeps_item_in_force() {
        let mut r = replica(ContentType::Data, ReplicaMode::Sync, true, 0);
        r.commence_era(1, Timestamp(10));
        r.alter(&AlterReplicaRequest::enabled(false)).unwrap();
        r.commence_era(2, Timestamp(20));
        assert_eq!(r.history().len(), 3);

        assert_eq!(r.remove_history_before(Timestamp(15)), 1);
        assert_eq!(r.history()[0].timestamp, Timestamp(10));
        assert_eq!(r.remove_history_before(Timestamp(5)), 0);
    }

    #[test]
    fn test_direct_writes_advance_caught_up_progress() {
        let mut r = replica(ContentType::Data, ReplicaMode::Sync, true, 0);
        r.record_write_target(true, Timestamp::MIN, Timestamp(10));
        assert_eq!(r.replication_progress().min_timestamp(), Timestamp(10));

        r.record_write_target(false, Timestamp(10), Timestamp(20));
        assert_eq!(r.direct_since(), None);
        assert_eq!(r.replication_progress().min_timestamp(), Timestamp(10));
    }

    #[test]
    fn test_lagging_direct_target_does_not_skip_backlog() {
        let mut r = replica(ContentType::Data, ReplicaMode::Sync, true, 0);
        // Writes up to 50 went elsewhere and must be pulled first
        r.record_write_target(true, Timestamp(50), Timestamp(60));
        assert_eq!(r.replication_progress().min_timestamp(), Timestamp::MIN);

        r.update_progress(&ReplicationProgress::uniform(Timestamp(50)))
            .unwrap();
        r.record_write_target(true, Timestamp(60), Timestamp(70));
        assert_eq!(r.replication_progress().min_timestamp(), Timestamp(70));
    }
}
