//! Rows, changes and table layout

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ChaosError, ChaosResult};
use crate::replica::ContentType;
use crate::types::{Key, RowKey, Timestamp};

/// Kind of a row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Write,
    Delete,
}

/// One change submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub key: RowKey,
    #[serde(default)]
    pub value: Option<Value>,
    /// Target tablet of an ordered table
    #[serde(default)]
    pub tablet_index: Option<u32>,
}

impl RowChange {
    pub fn write(key: RowKey, value: Value) -> Self {
        Self {
            kind: ChangeKind::Write,
            key,
            value: Some(value),
            tablet_index: None,
        }
    }

    pub fn delete(key: RowKey) -> Self {
        Self {
            kind: ChangeKind::Delete,
            key,
            value: None,
            tablet_index: None,
        }
    }

    pub fn in_tablet(mut self, tablet_index: u32) -> Self {
        self.tablet_index = Some(tablet_index);
        self
    }
}

/// A visible row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: RowKey,
    pub value: Value,
}

/// A change as stored in a queue log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRow {
    pub timestamp: Timestamp,
    pub tablet_index: u32,
    pub row_index: u64,
    pub change: RowChange,
}

impl ReplicationRow {
    /// Key under which progress for this row is tracked
    pub fn progress_key(&self, kind: TableKind) -> Key {
        match kind {
            TableKind::Sorted => Key::row(self.change.key.clone()),
            TableKind::Ordered => Key::Row(RowKey::tablet(self.tablet_index)),
        }
    }
}

/// Sorted tables are partitioned by key, ordered tables by tablet index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Sorted,
    Ordered,
}

/// Physical layout of a replica table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub kind: TableKind,
    pub content_type: ContentType,
    /// Lower key of every tablet; the first is always `Key::Min`
    pub pivot_keys: Vec<Key>,
}

impl TableSchema {
    /// Sorted table split at `pivots` (in addition to the minimum key)
    pub fn sorted(content_type: ContentType, pivots: Vec<Key>) -> ChaosResult<Self> {
        let mut pivot_keys = vec![Key::Min];
        pivot_keys.extend(pivots.into_iter().filter(|k| !k.is_min()));
        for pair in pivot_keys.windows(2) {
            if pair[0] >= pair[1] || pair[1].is_max() {
                return Err(ChaosError::invalid_request(format!(
                    "pivot keys must be strictly increasing row keys, got {} then {}",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self {
            kind: TableKind::Sorted,
            content_type,
            pivot_keys,
        })
    }

    /// Ordered table with `tablet_count` tablets
    pub fn ordered(content_type: ContentType, tablet_count: u32) -> ChaosResult<Self> {
        if tablet_count == 0 {
            return Err(ChaosError::invalid_request(
                "ordered table must have at least one tablet",
            ));
        }
        let mut pivot_keys = vec![Key::Min];
        pivot_keys.extend((1..tablet_count).map(|i| Key::Row(RowKey::tablet(i))));
        Ok(Self {
            kind: TableKind::Ordered,
            content_type,
            pivot_keys,
        })
    }

    pub fn tablet_count(&self) -> u32 {
        self.pivot_keys.len() as u32
    }

    /// Key range `[lower, upper)` of a tablet
    pub fn tablet_range(&self, tablet_index: u32) -> Option<(Key, Key)> {
        let index = tablet_index as usize;
        let lower = self.pivot_keys.get(index)?.clone();
        let upper = self.pivot_keys.get(index + 1).cloned().unwrap_or(Key::Max);
        Some((lower, upper))
    }

    /// Tablet a change belongs to
    pub fn tablet_for(&self, change: &RowChange) -> ChaosResult<u32> {
        match self.kind {
            TableKind::Sorted => {
                let key = Key::row(change.key.clone());
                let position = self.pivot_keys.partition_point(|p| p <= &key);
                Ok(position.saturating_sub(1) as u32)
            }
            TableKind::Ordered => {
                let tablet_index = change.tablet_index.unwrap_or(0);
                if tablet_index >= self.tablet_count() {
                    return Err(ChaosError::invalid_request(format!(
                        "tablet index {} is out of range, table has {} tablets",
                        tablet_index,
                        self.tablet_count()
                    )));
                }
                Ok(tablet_index)
            }
        }
    }

    /// Pivot keys other than the minimum key
    pub fn split_pivots(&self) -> Vec<Key> {
        self.pivot_keys.iter().skip(1).cloned().collect()
    }
}

/// Tablet metadata reported by the storage engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletDescriptor {
    pub tablet_index: u32,
    pub lower_key: Key,
    pub upper_key: Key,
    pub trimmed_row_count: u64,
    pub total_row_count: u64,
    /// Timestamp of the last trimmed row
    pub last_trimmed_timestamp: Option<Timestamp>,
}
