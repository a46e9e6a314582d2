//! Observability events
//!
//! Every observable transition of a chaos cell has a typed event.

use std::fmt;

/// Observable events of a chaos cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Cell startup begins
    CellStarting,
    /// Cell is serving requests
    CellServing,
    /// Cell shutdown complete
    CellStopped,
    /// Configuration loaded
    ConfigLoaded,

    // Cards
    CardCreated,
    CardRemoved,

    // Replicas
    ReplicaCreated,
    ReplicaRemoved,
    ReplicaAltered,
    ReplicaResharded,
    ProgressUpdated,
    HistoryExpired,

    // Eras
    EraCommenced,
    EraCommenceDeferred,
    EraAcknowledged,
    EraSettled,

    // Coordinators
    ShortcutsGranted,
    ShortcutsRevoked,
    ShortcutRpcFailed,
    CoordinatorSuspended,
    CoordinatorResumed,
    CoordinatorCellsUpdated,

    // Data plane
    RowsPulled,
    RowsApplied,
    RowsTrimmed,
    TrimRejected,
    WriteCommitted,
    WriteRejected,

    // Persistence
    SnapshotSaved,
    SnapshotLoaded,
    SnapshotCorrupted,
}

impl Event {
    /// Returns the event name as logged
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::CellStarting => "CHAOS_CELL_STARTUP_BEGIN",
            Event::CellServing => "CHAOS_CELL_SERVING",
            Event::CellStopped => "CHAOS_CELL_SHUTDOWN_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::CardCreated => "CARD_CREATED",
            Event::CardRemoved => "CARD_REMOVED",

            Event::ReplicaCreated => "REPLICA_CREATED",
            Event::ReplicaRemoved => "REPLICA_REMOVED",
            Event::ReplicaAltered => "REPLICA_ALTERED",
            Event::ReplicaResharded => "REPLICA_RESHARDED",
            Event::ProgressUpdated => "PROGRESS_UPDATED",
            Event::HistoryExpired => "HISTORY_EXPIRED",

            Event::EraCommenced => "ERA_COMMENCED",
            Event::EraCommenceDeferred => "ERA_COMMENCE_DEFERRED",
            Event::EraAcknowledged => "ERA_ACKNOWLEDGED",
            Event::EraSettled => "ERA_SETTLED",

            Event::ShortcutsGranted => "SHORTCUTS_GRANTED",
            Event::ShortcutsRevoked => "SHORTCUTS_REVOKED",
            Event::ShortcutRpcFailed => "SHORTCUT_RPC_FAILED",
            Event::CoordinatorSuspended => "COORDINATOR_SUSPENDED",
            Event::CoordinatorResumed => "COORDINATOR_RESUMED",
            Event::CoordinatorCellsUpdated => "COORDINATOR_CELLS_UPDATED",

            Event::RowsPulled => "ROWS_PULLED",
            Event::RowsApplied => "ROWS_APPLIED",
            Event::RowsTrimmed => "ROWS_TRIMMED",
            Event::TrimRejected => "TRIM_REJECTED",
            Event::WriteCommitted => "WRITE_COMMITTED",
            Event::WriteRejected => "WRITE_REJECTED",

            Event::SnapshotSaved => "SNAPSHOT_SAVED",
            Event::SnapshotLoaded => "SNAPSHOT_LOADED",
            Event::SnapshotCorrupted => "SNAPSHOT_CORRUPTED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::SnapshotCorrupted)
    }

    /// Whether the event records a card mutation
    ///
    /// Mutation events are suppressed when mutation logging is disabled.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Event::CardCreated
                | Event::CardRemoved
                | Event::ReplicaCreated
                | Event::ReplicaRemoved
                | Event::ReplicaAltered
                | Event::ReplicaResharded
                | Event::ProgressUpdated
                | Event::HistoryExpired
                | Event::EraAcknowledged
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_upper_snake_case() {
        let events = [
            Event::CellStarting,
            Event::CardCreated,
            Event::ReplicaAltered,
            Event::EraCommenced,
            Event::EraSettled,
            Event::ShortcutsRevoked,
            Event::CoordinatorSuspended,
            Event::RowsPulled,
            Event::TrimRejected,
            Event::WriteRejected,
            Event::SnapshotSaved,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::SnapshotCorrupted.is_fatal());
        assert!(!Event::TrimRejected.is_fatal());
    }

    #[test]
    fn test_mutation_events() {
        assert!(Event::ReplicaAltered.is_mutation());
        assert!(!Event::EraCommenced.is_mutation());
        assert_eq!(format!("{}", Event::EraSettled), "ERA_SETTLED");
    }
}
