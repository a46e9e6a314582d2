//! Replica content type, mode, state and derived write mode

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a replica stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Materialized rows, read by clients
    Data,
    /// Append-only change log, source of pulls
    Queue,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Data => "data",
            ContentType::Queue => "queue",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Replication mode, including the two transitional values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaMode {
    Sync,
    Async,
    SyncToAsync,
    AsyncToSync,
}

impl ReplicaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaMode::Sync => "sync",
            ReplicaMode::Async => "async",
            ReplicaMode::SyncToAsync => "sync_to_async",
            ReplicaMode::AsyncToSync => "async_to_sync",
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, ReplicaMode::Sync | ReplicaMode::Async)
    }

    /// Mode in force until the current transition completes
    pub fn stable_previous(&self) -> ReplicaMode {
        match self {
            ReplicaMode::Sync | ReplicaMode::SyncToAsync => ReplicaMode::Sync,
            ReplicaMode::Async | ReplicaMode::AsyncToSync => ReplicaMode::Async,
        }
    }

    /// Mode once the current transition completes
    pub fn stable_target(&self) -> ReplicaMode {
        match self {
            ReplicaMode::Sync | ReplicaMode::AsyncToSync => ReplicaMode::Sync,
            ReplicaMode::Async | ReplicaMode::SyncToAsync => ReplicaMode::Async,
        }
    }
}

impl fmt::Display for ReplicaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Replica state, including the two transitional values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Enabled,
    Disabled,
    Enabling,
    Disabling,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Enabled => "enabled",
            ReplicaState::Disabled => "disabled",
            ReplicaState::Enabling => "enabling",
            ReplicaState::Disabling => "disabling",
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, ReplicaState::Enabled | ReplicaState::Disabled)
    }

    /// State in force until the current transition completes
    pub fn stable_previous(&self) -> ReplicaState {
        match self {
            ReplicaState::Enabled | ReplicaState::Disabling => ReplicaState::Enabled,
            ReplicaState::Disabled | ReplicaState::Enabling => ReplicaState::Disabled,
        }
    }

    /// State once the current transition completes
    pub fn stable_target(&self) -> ReplicaState {
        match self {
            ReplicaState::Enabled | ReplicaState::Enabling => ReplicaState::Enabled,
            ReplicaState::Disabled | ReplicaState::Disabling => ReplicaState::Disabled,
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How writes reach a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Written synchronously inside the client transaction
    Direct,
    /// Catches up asynchronously by pulling from a queue
    Pull,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Direct => "direct",
            WriteMode::Pull => "pull",
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Derive the write mode of a replica
///
/// Transitional values are resolved to the stable value still in force.
pub fn write_mode(content_type: ContentType, mode: ReplicaMode, state: ReplicaState) -> WriteMode {
    match (content_type, mode, state.stable_previous()) {
        (ContentType::Data, ReplicaMode::Sync | ReplicaMode::SyncToAsync, ReplicaState::Enabled) => {
            WriteMode::Direct
        }
        (ContentType::Data, _, _) => WriteMode::Pull,
        // Sync queues receive the change log inside the transaction but are
        // never a direct target for row data.
        (ContentType::Queue, _, _) => WriteMode::Pull,
    }
}
