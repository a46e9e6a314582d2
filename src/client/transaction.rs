//! Client transactions

use serde_json::Value;

use crate::clock::TimestampProvider;
use crate::storage::RowChange;
use crate::types::{ClockTag, RowKey, Timestamp};

/// Buffered row changes committed at one timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub timestamp: Timestamp,
    /// Clock authority that generated `timestamp`
    pub clock_tag: Option<ClockTag>,
    pub changes: Vec<RowChange>,
}

impl Transaction {
    /// Start a transaction with a fresh timestamp from `clock`
    pub fn start(clock: &dyn TimestampProvider) -> Self {
        Self::at(clock.generate_timestamp(), clock.clock_tag())
    }

    pub fn at(timestamp: Timestamp, clock_tag: Option<ClockTag>) -> Self {
        Self {
            timestamp,
            clock_tag,
            changes: Vec::new(),
        }
    }

    pub fn write(mut self, key: RowKey, value: Value) -> Self {
        self.changes.push(RowChange::write(key, value));
        self
    }

    pub fn delete(mut self, key: RowKey) -> Self {
        self.changes.push(RowChange::delete(key));
        self
    }

    pub fn push(&mut self, change: RowChange) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
