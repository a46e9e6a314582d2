//! Replica history

use serde::{Deserialize, Serialize};

use super::mode::{ReplicaMode, ReplicaState};
use crate::types::{Era, Timestamp};

/// (mode, state) of a replica from `timestamp` on, introduced by `era`
///
/// A replica's history is ordered by era and by timestamp. Versioned reads
/// replay it to find which configuration was in force at a given time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaHistoryItem {
    pub era: Era,
    pub timestamp: Timestamp,
    pub mode: ReplicaMode,
    pub state: ReplicaState,
}

impl ReplicaHistoryItem {
    pub fn new(era: Era, timestamp: Timestamp, mode: ReplicaMode, state: ReplicaState) -> Self {
        Self {
            era,
            timestamp,
            mode,
            state,
        }
    }

    pub fn is_sync(&self) -> bool {
        self.mode == ReplicaMode::Sync
    }

    pub fn is_enabled(&self) -> bool {
        self.state == ReplicaState::Enabled
    }
}

/// Index of the item in force at `timestamp`
///
/// `None` when `timestamp` precedes the first recorded transition.
pub(super) fn find_index_by_timestamp(
    history: &[ReplicaHistoryItem],
    timestamp: Timestamp,
) -> Option<usize> {
    let position = history.partition_point(|item| item.timestamp <= timestamp);
    position.checked_sub(1)
}

/// Index of the item in force at `era`
pub(super) fn find_index_by_era(history: &[ReplicaHistoryItem], era: Era) -> Option<usize> {
    let position = history.partition_point(|item| item.era <= era);
    position.checked_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<ReplicaHistoryItem> {
        vec![
            ReplicaHistoryItem::new(0, Timestamp(0), ReplicaMode::Sync, ReplicaState::Disabled),
            ReplicaHistoryItem::new(2, Timestamp(100), ReplicaMode::Sync, ReplicaState::Enabled),
            ReplicaHistoryItem::new(5, Timestamp(300), ReplicaMode::Async, ReplicaState::Enabled),
        ]
    }

    #[test]
    fn test_find_by_timestamp() {
        let history = history();
        assert_eq!(find_index_by_timestamp(&history, Timestamp(0)), Some(0));
        assert_eq!(find_index_by_timestamp(&history, Timestamp(99)), Some(0));
        assert_eq!(find_index_by_timestamp(&history, Timestamp(100)), Some(1));
        assert_eq!(find_index_by_timestamp(&history, Timestamp(1000)), Some(2));
    }

    #[test]
    fn test_find_before_first_item() {
        let history = vec![ReplicaHistoryItem::new(
            1,
            Timestamp(50),
            ReplicaMode::Async,
            ReplicaState::Enabled,
        )];
        assert_eq!(find_index_by_timestamp(&history, Timestamp(49)), None);
        assert_eq!(find_index_by_timestamp(&[], Timestamp(49)), None);
    }

    #[test]
    fn test_find_by_era() {
        let history = history();
        assert_eq!(find_index_by_era(&history, 1), Some(0));
        assert_eq!(find_index_by_era(&history, 4), Some(1));
        assert_eq!(find_index_by_era(&history, 5), Some(2));
    }
}
