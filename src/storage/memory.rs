//! In-memory storage engine
//!
//! Each table lives behind one mutex, so a replicated batch and its
//! progress are applied atomically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::row::{
    ChangeKind, ReplicationRow, Row, RowChange, TableKind, TableSchema, TabletDescriptor,
};
use super::store::ReplicaStore;
use crate::errors::{ChaosError, ChaosResult};
use crate::progress::ReplicationProgress;
use crate::replica::ContentType;
use crate::types::{Key, RowKey, Timestamp};

#[derive(Debug, Clone)]
struct Version {
    timestamp: Timestamp,
    value: Option<Value>,
}

#[derive(Debug, Default)]
struct MemoryTablet {
    rows: VecDeque<ReplicationRow>,
    trimmed_row_count: u64,
    last_trimmed_timestamp: Option<Timestamp>,
}

impl MemoryTablet {
    fn total_row_count(&self) -> u64 {
        self.trimmed_row_count + self.rows.len() as u64
    }

    fn contains(&self, change: &RowChange, timestamp: Timestamp) -> bool {
        self.rows
            .iter()
            .any(|r| r.timestamp == timestamp && r.change.key == change.key)
    }
}

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    tablets: Vec<MemoryTablet>,
    versions: BTreeMap<RowKey, Vec<Version>>,
    progress: Option<ReplicationProgress>,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        let tablets = (0..schema.tablet_count())
            .map(|_| MemoryTablet::default())
            .collect();
        Self {
            schema,
            tablets,
            versions: BTreeMap::new(),
            progress: None,
        }
    }

    fn tablet(&self, tablet_index: u32) -> ChaosResult<&MemoryTablet> {
        self.tablets.get(tablet_index as usize).ok_or_else(|| {
            ChaosError::invalid_request(format!("no tablet {} in table", tablet_index))
        })
    }

    fn tablet_mut(&mut self, tablet_index: u32) -> ChaosResult<&mut MemoryTablet> {
        self.tablets.get_mut(tablet_index as usize).ok_or_else(|| {
            ChaosError::invalid_request(format!("no tablet {} in table", tablet_index))
        })
    }

    /// Apply one change; `source_tablet` pins the tablet of ordered rows
    fn apply_change(
        &mut self,
        change: &RowChange,
        timestamp: Timestamp,
        source_tablet: Option<u32>,
    ) -> ChaosResult<()> {
        match self.schema.content_type {
            ContentType::Data => {
                let versions = self.versions.entry(change.key.clone()).or_default();
                let position = versions.partition_point(|v| v.timestamp < timestamp);
                let exists = versions
                    .get(position)
                    .map_or(false, |v| v.timestamp == timestamp);
                if !exists {
                    let value = match change.kind {
                        ChangeKind::Write => change.value.clone(),
                        ChangeKind::Delete => None,
                    };
                    versions.insert(position, Version { timestamp, value });
                }
            }
            ContentType::Queue => {
                let tablet_index = match (self.schema.kind, source_tablet) {
                    (TableKind::Ordered, Some(tablet_index)) => {
                        self.schema.tablet_for(&change.clone().in_tablet(tablet_index))?
                    }
                    _ => self.schema.tablet_for(change)?,
                };
                let tablet = self.tablet_mut(tablet_index)?;
                if !tablet.contains(change, timestamp) {
                    let row_index = tablet.total_row_count();
                    tablet.rows.push_back(ReplicationRow {
                        timestamp,
                        tablet_index,
                        row_index,
                        change: change.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> Vec<TabletDescriptor> {
        self.tablets
            .iter()
            .enumerate()
            .map(|(index, tablet)| {
                let (lower_key, upper_key) = self
                    .schema
                    .tablet_range(index as u32)
                    .unwrap_or((Key::Min, Key::Max));
                TabletDescriptor {
                    tablet_index: index as u32,
                    lower_key,
                    upper_key,
                    trimmed_row_count: tablet.trimmed_row_count,
                    total_row_count: tablet.total_row_count(),
                    last_trimmed_timestamp: tablet.last_trimmed_timestamp,
                }
            })
            .collect()
    }

    fn require_data(&self, path: &str) -> ChaosResult<()> {
        if self.schema.content_type != ContentType::Data {
            return Err(ChaosError::invalid_request(format!(
                "table {} is not a data table",
                path
            )));
        }
        Ok(())
    }
}

/// Storage engine keeping every table in memory
///
/// Availability can be toggled to simulate a partitioned cluster.
#[derive(Debug)]
pub struct MemoryReplicaStore {
    cluster_name: String,
    available: AtomicBool,
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryReplicaStore {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            available: AtomicBool::new(true),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> ChaosResult<MutexGuard<'_, HashMap<String, MemoryTable>>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ChaosError::ClusterUnavailable(self.cluster_name.clone()));
        }
        self.tables
            .lock()
            .map_err(|_| ChaosError::Internal("memory store lock poisoned".into()))
    }

    fn no_such_table(&self, path: &str) -> ChaosError {
        ChaosError::invalid_request(format!(
            "no table {} on cluster {}",
            path, self.cluster_name
        ))
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplicaStore {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    async fn create_table(&self, path: &str, schema: TableSchema) -> ChaosResult<()> {
        let mut tables = self.lock()?;
        if tables.contains_key(path) {
            return Err(ChaosError::invalid_request(format!(
                "table {} already exists on cluster {}",
                path, self.cluster_name
            )));
        }
        tables.insert(path.to_string(), MemoryTable::new(schema));
        Ok(())
    }

    async fn table_schema(&self, path: &str) -> ChaosResult<TableSchema> {
        let tables = self.lock()?;
        tables
            .get(path)
            .map(|t| t.schema.clone())
            .ok_or_else(|| self.no_such_table(path))
    }

    async fn describe_tablets(&self, path: &str) -> ChaosResult<Vec<TabletDescriptor>> {
        let tables = self.lock()?;
        tables
            .get(path)
            .map(|t| t.describe())
            .ok_or_else(|| self.no_such_table(path))
    }

    async fn write_rows(
        &self,
        path: &str,
        changes: &[RowChange],
        timestamp: Timestamp,
    ) -> ChaosResult<()> {
        let mut tables = self.lock()?;
        let table = tables
            .get_mut(path)
            .ok_or_else(|| self.no_such_table(path))?;
        for change in changes {
            table.apply_change(change, timestamp, change.tablet_index)?;
        }
        Ok(())
    }

    async fn read_queue(
        &self,
        path: &str,
        tablet_index: u32,
        start_row_index: u64,
    ) -> ChaosResult<Vec<ReplicationRow>> {
        let tables = self.lock()?;
        let table = tables.get(path).ok_or_else(|| self.no_such_table(path))?;
        let tablet = table.tablet(tablet_index)?;
        Ok(tablet
            .rows
            .iter()
            .filter(|r| r.row_index >= start_row_index)
            .cloned()
            .collect())
    }

    async fn trim_queue(
        &self,
        path: &str,
        tablet_index: u32,
        trimmed_row_count: u64,
    ) -> ChaosResult<u64> {
        let mut tables = self.lock()?;
        let table = tables
            .get_mut(path)
            .ok_or_else(|| self.no_such_table(path))?;
        let tablet = table.tablet_mut(tablet_index)?;
        if trimmed_row_count > tablet.total_row_count() {
            return Err(ChaosError::invalid_request(format!(
                "cannot trim {} rows from tablet {} holding {} rows",
                trimmed_row_count,
                tablet_index,
                tablet.total_row_count()
            )));
        }

        let mut dropped = 0;
        while tablet.trimmed_row_count < trimmed_row_count {
            match tablet.rows.pop_front() {
                Some(row) => {
                    tablet.last_trimmed_timestamp = Some(
                        tablet
                            .last_trimmed_timestamp
                            .map_or(row.timestamp, |t| t.max(row.timestamp)),
                    );
                    tablet.trimmed_row_count += 1;
                    dropped += 1;
                }
                None => break,
            }
        }
        Ok(dropped)
    }

    async fn apply_replicated_rows(
        &self,
        path: &str,
        rows: &[ReplicationRow],
        progress: &ReplicationProgress,
    ) -> ChaosResult<()> {
        progress.validate()?;
        let mut tables = self.lock()?;
        let table = tables
            .get_mut(path)
            .ok_or_else(|| self.no_such_table(path))?;

        // Validate the merged progress before touching any row
        let merged = match &table.progress {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.update(progress)?;
                merged
            }
            None => progress.clone(),
        };
        for row in rows {
            table.apply_change(&row.change, row.timestamp, Some(row.tablet_index))?;
        }
        table.progress = Some(merged);
        Ok(())
    }

    async fn replication_progress(&self, path: &str) -> ChaosResult<Option<ReplicationProgress>> {
        let tables = self.lock()?;
        tables
            .get(path)
            .map(|t| t.progress.clone())
            .ok_or_else(|| self.no_such_table(path))
    }

    async fn reshard(&self, path: &str, pivots: Vec<Key>) -> ChaosResult<TableSchema> {
        let mut tables = self.lock()?;
        let table = tables
            .get_mut(path)
            .ok_or_else(|| self.no_such_table(path))?;
        if table.schema.kind != TableKind::Sorted {
            return Err(ChaosError::invalid_request(format!(
                "table {} is ordered and cannot be resharded by key",
                path
            )));
        }
        if table.tablets.iter().any(|t| !t.rows.is_empty()) {
            return Err(ChaosError::invalid_request(format!(
                "table {} has untrimmed queue rows",
                path
            )));
        }

        let schema = TableSchema::sorted(table.schema.content_type, pivots)?;
        table.tablets = (0..schema.tablet_count())
            .map(|_| MemoryTablet::default())
            .collect();
        table.schema = schema.clone();
        Ok(schema)
    }

    async fn lookup_rows(
        &self,
        path: &str,
        keys: &[RowKey],
        timestamp: Timestamp,
    ) -> ChaosResult<Vec<Option<Row>>> {
        let tables = self.lock()?;
        let table = tables.get(path).ok_or_else(|| self.no_such_table(path))?;
        table.require_data(path)?;

        Ok(keys
            .iter()
            .map(|key| {
                let versions = table.versions.get(key)?;
                let position = versions.partition_point(|v| v.timestamp <= timestamp);
                let version = versions.get(position.checked_sub(1)?)?;
                version.value.clone().map(|value| Row {
                    key: key.clone(),
                    value,
                })
            })
            .collect())
    }

    async fn select_rows(&self, path: &str, timestamp: Timestamp) -> ChaosResult<Vec<Row>> {
        let tables = self.lock()?;
        let table = tables.get(path).ok_or_else(|| self.no_such_table(path))?;

        let rows = match table.schema.content_type {
            ContentType::Data => table
                .versions
                .iter()
                .filter_map(|(key, versions)| {
                    let position = versions.partition_point(|v| v.timestamp <= timestamp);
                    let version = versions.get(position.checked_sub(1)?)?;
                    version.value.clone().map(|value| Row {
                        key: key.clone(),
                        value,
                    })
                })
                .collect(),
            ContentType::Queue => table
                .tablets
                .iter()
                .flat_map(|tablet| tablet.rows.iter())
                .filter(|r| r.timestamp <= timestamp && r.change.kind == ChangeKind::Write)
                .filter_map(|r| {
                    r.change.value.clone().map(|value| Row {
                        key: r.change.key.clone(),
                        value,
                    })
                })
                .collect(),
        };
        Ok(rows)
    }
}
