//! # Chaos Errors
//!
//! One error type shared by every chaos subsystem. Each variant belongs to
//! a category that tells the caller whether retrying can help.

use std::fmt;

use thiserror::Error;

use crate::types::{CardId, CellId, ClockTag, Era, ReplicaId, Timestamp};

/// Result type for chaos operations
pub type ChaosResult<T> = Result<T, ChaosError>;

/// Broad classes of failure surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Request conflicts with the current card topology
    TopologyConflict,
    /// Request would have broken a replication safety property
    SafetyViolationPrevented,
    /// A dependency could not be reached or has not converged yet
    Unavailable,
    /// Timestamp was produced by a foreign clock
    ClockMismatch,
    /// Malformed request
    InvalidRequest,
    /// Referenced object does not exist
    NotFound,
    /// Local failure (persistence, corruption)
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TopologyConflict => "TOPOLOGY_CONFLICT",
            ErrorCategory::SafetyViolationPrevented => "SAFETY_VIOLATION_PREVENTED",
            ErrorCategory::Unavailable => "UNAVAILABLE",
            ErrorCategory::ClockMismatch => "CLOCK_MISMATCH",
            ErrorCategory::InvalidRequest => "INVALID_REQUEST",
            ErrorCategory::NotFound => "NOT_FOUND",
            ErrorCategory::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chaos errors
#[derive(Debug, Clone, Error)]
pub enum ChaosError {
    #[error("No such replication card {0}")]
    NoSuchCard(CardId),

    #[error("Replication card {0} already exists")]
    CardAlreadyExists(CardId),

    #[error("No such replica {0}")]
    NoSuchReplica(ReplicaId),

    #[error("Replica already exists (cluster: {cluster}, path: {path})")]
    ReplicaAlreadyExists { cluster: String, path: String },

    #[error("Replication card {card_id} already has {limit} replicas")]
    TooManyReplicas { card_id: CardId, limit: usize },

    #[error("Could not remove replica since it is not disabled (replica: {0})")]
    ReplicaNotDisabled(ReplicaId),

    #[error("Replica mode is transitioning (replica: {0})")]
    ModeTransitioning(ReplicaId),

    #[error("Replica state is transitioning (replica: {0})")]
    StateTransitioning(ReplicaId),

    #[error("Could not create replica since all other replicas already left it behind (card: {0})")]
    BacklogUnavailable(CardId),

    #[error("Could not trim tablet since some replicas may not be replicated up to this point (replica: {replica_id}, tablet: {tablet_index}, reason: {reason})")]
    TrimRejected {
        replica_id: ReplicaId,
        tablet_index: u32,
        reason: String,
    },

    #[error("Rows up to {trimmed_timestamp} were trimmed from tablet {tablet_index} but requested from {requested}")]
    RowsTrimmed {
        tablet_index: u32,
        trimmed_timestamp: Timestamp,
        requested: Timestamp,
    },

    #[error("Replication card {0} has no sync queue replica")]
    NoSyncQueue(CardId),

    #[error("No coordinator holds a shortcut for replication card {0}")]
    NoCoordinator(CardId),

    #[error("No in-sync replicas found for replication card {0}")]
    NoInSyncReplicas(CardId),

    #[error("Could not suspend coordinator {0} since it is the last active one")]
    LastActiveCoordinator(CellId),

    #[error("Cluster {0} is unavailable")]
    ClusterUnavailable(String),

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Replication card {card_id} is at era {actual} while era {expected} was expected")]
    EraMismatch {
        card_id: CardId,
        expected: Era,
        actual: Era,
    },

    #[error("Replication era {era} is not settled for card {card_id}")]
    EraNotSettled { card_id: CardId, era: Era },

    #[error("Transaction timestamp is generated from unexpected clock (expected: {expected:?}, actual: {actual:?})")]
    ClockMismatch {
        expected: Option<ClockTag>,
        actual: Option<ClockTag>,
    },

    #[error("Transaction timestamp {timestamp} is not newer than last write {last_write}")]
    StaleTimestamp {
        timestamp: Timestamp,
        last_write: Timestamp,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChaosError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        ChaosError::InvalidRequest(message.into())
    }

    pub fn timeout(operation: impl Into<String>, millis: u64) -> Self {
        ChaosError::Timeout {
            operation: operation.into(),
            millis,
        }
    }

    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChaosError::NoSuchCard(_) | ChaosError::NoSuchReplica(_) => ErrorCategory::NotFound,
            ChaosError::CardAlreadyExists(_)
            | ChaosError::ReplicaAlreadyExists { .. }
            | ChaosError::TooManyReplicas { .. }
            | ChaosError::ReplicaNotDisabled(_)
            | ChaosError::ModeTransitioning(_)
            | ChaosError::StateTransitioning(_)
            | ChaosError::EraMismatch { .. }
            | ChaosError::LastActiveCoordinator(_) => ErrorCategory::TopologyConflict,
            ChaosError::BacklogUnavailable(_)
            | ChaosError::TrimRejected { .. }
            | ChaosError::RowsTrimmed { .. } => ErrorCategory::SafetyViolationPrevented,
            ChaosError::NoSyncQueue(_)
            | ChaosError::NoCoordinator(_)
            | ChaosError::NoInSyncReplicas(_)
            | ChaosError::ClusterUnavailable(_)
            | ChaosError::Timeout { .. }
            | ChaosError::EraNotSettled { .. } => ErrorCategory::Unavailable,
            ChaosError::ClockMismatch { .. } => ErrorCategory::ClockMismatch,
            ChaosError::StaleTimestamp { .. } | ChaosError::InvalidRequest(_) => {
                ErrorCategory::InvalidRequest
            }
            ChaosError::SnapshotCorrupted(_)
            | ChaosError::Io(_)
            | ChaosError::Serialization(_)
            | ChaosError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the same request may succeed later without caller changes
    pub fn is_retryable(&self) -> bool {
        match self.category() {
            ErrorCategory::Unavailable => true,
            ErrorCategory::TopologyConflict => matches!(
                self,
                ChaosError::ModeTransitioning(_)
                    | ChaosError::StateTransitioning(_)
                    | ChaosError::EraMismatch { .. }
            ),
            ErrorCategory::SafetyViolationPrevented => {
                matches!(self, ChaosError::TrimRejected { .. })
            }
            ErrorCategory::InvalidRequest => matches!(self, ChaosError::StaleTimestamp { .. }),
            _ => false,
        }
    }
}

impl From<std::io::Error> for ChaosError {
    fn from(e: std::io::Error) -> Self {
        ChaosError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ChaosError {
    fn from(e: serde_json::Error) -> Self {
        ChaosError::Serialization(e.to_string())
    }
}
