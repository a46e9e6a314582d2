//! PullRows
//!
//! A pull is a pure function of the queue contents and the caller's
//! cursor: it returns every row newer than the cursor and not newer than
//! the upper timestamp, and the cursor advanced past exactly those rows.
//! Pulling twice with the same cursor returns the same answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::order::order_by_timestamp;
use crate::errors::{ChaosError, ChaosResult};
use crate::progress::ReplicationProgress;
use crate::replica::ContentType;
use crate::storage::{ReplicaStore, ReplicationRow};
use crate::types::{Key, ReplicaId, Timestamp};

/// Default row budget of one pull
pub const DEFAULT_MAX_PULL_ROWS: usize = 1024;

fn default_max_rows() -> usize {
    DEFAULT_MAX_PULL_ROWS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRowsRequest {
    /// Cursor: rows up to these timestamps are already replicated
    pub replication_progress: ReplicationProgress,
    pub upstream_replica_id: ReplicaId,
    #[serde(default)]
    pub upper_timestamp: Option<Timestamp>,
    /// Merge rows of all tablets into one timestamp-ordered sequence
    #[serde(default)]
    pub order_rows_by_timestamp: bool,
    /// Row index to start reading each tablet at
    #[serde(default)]
    pub start_replication_row_indexes: BTreeMap<u32, u64>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl PullRowsRequest {
    pub fn new(replication_progress: ReplicationProgress, upstream_replica_id: ReplicaId) -> Self {
        Self {
            replication_progress,
            upstream_replica_id,
            upper_timestamp: None,
            order_rows_by_timestamp: false,
            start_replication_row_indexes: BTreeMap::new(),
            max_rows: DEFAULT_MAX_PULL_ROWS,
        }
    }

    pub fn with_upper_timestamp(mut self, upper_timestamp: Timestamp) -> Self {
        self.upper_timestamp = Some(upper_timestamp);
        self
    }

    pub fn ordered(mut self) -> Self {
        self.order_rows_by_timestamp = true;
        self
    }

    pub fn with_start_row_indexes(mut self, indexes: BTreeMap<u32, u64>) -> Self {
        self.start_replication_row_indexes = indexes;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRowsResponse {
    pub rows: Vec<ReplicationRow>,
    /// The request cursor advanced past the returned rows
    pub replication_progress: ReplicationProgress,
    /// Per tablet, the index after the last row the new cursor covers
    pub end_replication_row_indexes: BTreeMap<u32, u64>,
}

struct ScannedTablet {
    tablet_index: u32,
    lower: Key,
    upper: Key,
    start: u64,
    rows: Vec<ReplicationRow>,
}

impl ScannedTablet {
    fn contains(&self, key: &Key) -> bool {
        &self.lower <= key && key < &self.upper
    }
}

/// Pull rows from the queue replica at `path`
pub async fn pull_rows(
    store: &dyn ReplicaStore,
    path: &str,
    request: &PullRowsRequest,
) -> ChaosResult<PullRowsResponse> {
    let cursor = &request.replication_progress;
    cursor.validate()?;
    if request.max_rows == 0 {
        return Err(ChaosError::invalid_request("max_rows must be positive"));
    }

    let schema = store.table_schema(path).await?;
    if schema.content_type != ContentType::Queue {
        return Err(ChaosError::invalid_request(format!(
            "rows can only be pulled from queue replicas, {} is a {} replica",
            path, schema.content_type
        )));
    }
    let upper_timestamp = request.upper_timestamp.unwrap_or(Timestamp::MAX);

    let mut scanned = Vec::new();
    let mut candidates = Vec::new();
    for tablet in store.describe_tablets(path).await? {
        let lower = (&tablet.lower_key).max(cursor.lower_key()).clone();
        let upper = (&tablet.upper_key).min(cursor.upper_key()).clone();
        if lower >= upper {
            continue;
        }
        let Some(cursor_min) = cursor.min_timestamp_in(&lower, &upper) else {
            continue;
        };
        if let Some(trimmed) = tablet.last_trimmed_timestamp {
            if trimmed > cursor_min {
                return Err(ChaosError::RowsTrimmed {
                    tablet_index: tablet.tablet_index,
                    trimmed_timestamp: trimmed,
                    requested: cursor_min,
                });
            }
        }

        let start = request
            .start_replication_row_indexes
            .get(&tablet.tablet_index)
            .copied()
            .unwrap_or(0)
            .max(tablet.trimmed_row_count);
        let rows = store.read_queue(path, tablet.tablet_index, start).await?;
        let scan = ScannedTablet {
            tablet_index: tablet.tablet_index,
            lower,
            upper,
            start,
            rows,
        };

        let tablet_candidates: Vec<ReplicationRow> = scan
            .rows
            .iter()
            .filter(|row| {
                let key = row.progress_key(schema.kind);
                scan.contains(&key)
                    && cursor.timestamp_at(&key).map_or(false, |ts| row.timestamp > ts)
                    && row.timestamp <= upper_timestamp
            })
            .cloned()
            .collect();
        candidates.push(tablet_candidates);
        scanned.push(scan);
    }

    let mut rows = order_by_timestamp(candidates);

    // The cursor may only move to a timestamp all of whose rows are returned
    let bound = if rows.len() > request.max_rows {
        let cut = rows[request.max_rows].timestamp;
        let end = rows.partition_point(|r| r.timestamp < cut);
        if end == 0 {
            rows.truncate(rows.partition_point(|r| r.timestamp <= cut));
            Some(cut)
        } else {
            rows.truncate(end);
            Some(cut.prev())
        }
    } else {
        request
            .upper_timestamp
            .or_else(|| rows.last().map(|r| r.timestamp))
    };

    let mut replication_progress = cursor.clone();
    if let Some(bound) = bound {
        for scan in &scanned {
            replication_progress.advance(&scan.lower, &scan.upper, bound)?;
        }
    }

    let end_replication_row_indexes = scanned
        .iter()
        .map(|scan| {
            let mut end = scan.start;
            for row in &scan.rows {
                let key = row.progress_key(schema.kind);
                let consumed = scan.contains(&key)
                    && replication_progress
                        .timestamp_at(&key)
                        .map_or(false, |ts| row.timestamp <= ts);
                if !consumed {
                    break;
                }
                end = row.row_index + 1;
            }
            (scan.tablet_index, end)
        })
        .collect();

    if !request.order_rows_by_timestamp {
        rows.sort_by_key(|r| (r.tablet_index, r.row_index));
    }

    Ok(PullRowsResponse {
        rows,
        replication_progress,
        end_replication_row_indexes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pull::order::is_ordered_by_timestamp;
    use crate::storage::{MemoryReplicaStore, RowChange, TableSchema};
    use crate::types::{CardId, RowKey};
    use serde_json::json;

    fn upstream() -> ReplicaId {
        ReplicaId::new(CardId::generate(), 0)
    }

    async fn queue(pivots: Vec<Key>) -> MemoryReplicaStore {
        let store = MemoryReplicaStore::new("primary");
        store
            .create_table("//q", TableSchema::sorted(ContentType::Queue, pivots).unwrap())
            .await
            .unwrap();
        store
    }

    async fn write(store: &MemoryReplicaStore, key: i64, ts: u64) {
        store
            .write_rows("//q", &[RowChange::write(RowKey::int(key), json!(key))], Timestamp(ts))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pull_is_idempotent() {
        let store = queue(vec![]).await;
        write(&store, 0, 10).await;
        write(&store, 1, 20).await;

        let request = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp::MIN), upstream())
            .with_upper_timestamp(Timestamp(20));
        let first = pull_rows(&store, "//q", &request).await.unwrap();
        let second = pull_rows(&store, "//q", &request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.replication_progress.min_timestamp(), Timestamp(20));
        assert_eq!(first.end_replication_row_indexes.get(&0), Some(&2));
    }

    #[tokio::test]
    async fn test_respects_cursor_and_upper() {
        let store = queue(vec![]).await;
        write(&store, 0, 10).await;
        write(&store, 1, 20).await;
        write(&store, 2, 30).await;

        let request = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp(10)), upstream())
            .with_upper_timestamp(Timestamp(20));
        let response = pull_rows(&store, "//q", &request).await.unwrap();
        assert_eq!(response.rows.len(), 1);
        assert_eq!(response.rows[0].timestamp, Timestamp(20));
        // Row 30 is beyond the new cursor, so the consumed prefix ends there
        assert_eq!(response.end_replication_row_indexes.get(&0), Some(&2));
    }

    #[tokio::test]
    async fn test_budget_cuts_at_timestamp_boundary() {
        let store = queue(vec![]).await;
        write(&store, 0, 10).await;
        store
            .write_rows(
                "//q",
                &[
                    RowChange::write(RowKey::int(1), json!(1)),
                    RowChange::write(RowKey::int(2), json!(2)),
                ],
                Timestamp(20),
            )
            .await
            .unwrap();

        let request = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp::MIN), upstream())
            .with_upper_timestamp(Timestamp(100))
            .with_max_rows(2);
        let response = pull_rows(&store, "//q", &request).await.unwrap();
        assert_eq!(response.rows.len(), 1);
        assert_eq!(response.replication_progress.min_timestamp(), Timestamp(19));

        // A single timestamp larger than the budget is returned whole
        let request = PullRowsRequest {
            replication_progress: ReplicationProgress::uniform(Timestamp(10)),
            ..request.with_max_rows(1)
        };
        let response = pull_rows(&store, "//q", &request).await.unwrap();
        assert_eq!(response.rows.len(), 2);
        assert_eq!(response.replication_progress.min_timestamp(), Timestamp(20));
    }

    #[tokio::test]
    async fn test_ordered_merge_across_tablets() {
        let store = queue(vec![Key::int(10)]).await;
        write(&store, 11, 5).await;
        write(&store, 1, 7).await;
        write(&store, 12, 9).await;

        let request = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp::MIN), upstream())
            .with_upper_timestamp(Timestamp(10))
            .ordered();
        let response = pull_rows(&store, "//q", &request).await.unwrap();
        assert!(is_ordered_by_timestamp(&response.rows));
        assert_eq!(response.rows[0].tablet_index, 1);

        let unordered = PullRowsRequest {
            order_rows_by_timestamp: false,
            ..request
        };
        let response = pull_rows(&store, "//q", &unordered).await.unwrap();
        assert_eq!(response.rows[0].tablet_index, 0);
    }

    #[tokio::test]
    async fn test_trimmed_rows_are_reported() {
        let store = queue(vec![]).await;
        write(&store, 0, 10).await;
        write(&store, 1, 20).await;
        store.trim_queue("//q", 0, 1).await.unwrap();

        let behind = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp(5)), upstream());
        let err = pull_rows(&store, "//q", &behind).await.unwrap_err();
        assert!(matches!(
            err,
            ChaosError::RowsTrimmed {
                trimmed_timestamp: Timestamp(10),
                ..
            }
        ));

        let caught_up = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp(10)), upstream())
            .with_upper_timestamp(Timestamp(20));
        let response = pull_rows(&store, "//q", &caught_up).await.unwrap();
        assert_eq!(response.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_start_row_indexes_skip_rows() {
        let store = queue(vec![]).await;
        write(&store, 0, 10).await;
        write(&store, 1, 20).await;

        let request = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp::MIN), upstream())
            .with_upper_timestamp(Timestamp(20))
            .with_start_row_indexes(BTreeMap::from([(0, 1)]));
        let response = pull_rows(&store, "//q", &request).await.unwrap();
        assert_eq!(response.rows.len(), 1);
        assert_eq!(response.rows[0].row_index, 1);
    }

    #[tokio::test]
    async fn test_rejects_data_tables() {
        let store = MemoryReplicaStore::new("primary");
        store
            .create_table("//d", TableSchema::sorted(ContentType::Data, vec![]).unwrap())
            .await
            .unwrap();
        let request = PullRowsRequest::new(ReplicationProgress::uniform(Timestamp::MIN), upstream());
        assert!(pull_rows(&store, "//d", &request).await.is_err());
    }
}
