//! Storage engine interface

use async_trait::async_trait;

use super::row::{ReplicationRow, Row, RowChange, TableSchema, TabletDescriptor};
use crate::errors::ChaosResult;
use crate::progress::ReplicationProgress;
use crate::types::{Key, RowKey, Timestamp};

/// Storage engine of one cluster
///
/// Every call may fail with `ChaosError::ClusterUnavailable` when the
/// cluster cannot be reached; callers surface it as a retryable error.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Name of the cluster this store serves
    fn cluster_name(&self) -> &str;

    async fn create_table(&self, path: &str, schema: TableSchema) -> ChaosResult<()>;

    async fn table_schema(&self, path: &str) -> ChaosResult<TableSchema>;

    async fn describe_tablets(&self, path: &str) -> ChaosResult<Vec<TabletDescriptor>>;

    /// Commit client changes at `timestamp`
    ///
    /// Data tables store a new row version; queue tables append the
    /// changes to the log of the owning tablet.
    async fn write_rows(&self, path: &str, changes: &[RowChange], timestamp: Timestamp)
        -> ChaosResult<()>;

    /// Untrimmed log rows of a tablet starting at `start_row_index`
    async fn read_queue(
        &self,
        path: &str,
        tablet_index: u32,
        start_row_index: u64,
    ) -> ChaosResult<Vec<ReplicationRow>>;

    /// Discard log rows below `trimmed_row_count`; returns rows dropped
    async fn trim_queue(&self, path: &str, tablet_index: u32, trimmed_row_count: u64)
        -> ChaosResult<u64>;

    /// Apply pulled rows and merge `progress` into the table progress
    ///
    /// Both take effect atomically. Rows already present (same key and
    /// timestamp) are skipped.
    async fn apply_replicated_rows(
        &self,
        path: &str,
        rows: &[ReplicationRow],
        progress: &ReplicationProgress,
    ) -> ChaosResult<()>;

    /// Progress persisted with the table, if any rows were ever applied
    async fn replication_progress(&self, path: &str) -> ChaosResult<Option<ReplicationProgress>>;

    /// Re-partition a table at new pivot keys
    async fn reshard(&self, path: &str, pivots: Vec<Key>) -> ChaosResult<TableSchema>;

    /// Versioned point lookups at `timestamp`
    async fn lookup_rows(&self, path: &str, keys: &[RowKey], timestamp: Timestamp)
        -> ChaosResult<Vec<Option<Row>>>;

    /// Full scan at `timestamp`
    async fn select_rows(&self, path: &str, timestamp: Timestamp) -> ChaosResult<Vec<Row>>;
}
