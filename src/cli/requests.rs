//! Request dispatch of the serving loop
//!
//! Every request is a JSON object tagged by `op`:
//! ```json
//! {"op": "create_card", "table_path": "//home/t"}
//! {"op": "create_replica", "card_id": "...", "cluster_name": "primary", "replica_path": "//q", "content_type": "queue", "mode": "sync"}
//! {"op": "insert_rows", "card_id": "...", "rows": [{"key": [{"int64": 1}], "value": {"v": 1}}]}
//! ```

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::card::CardOptions;
use crate::cell::ChaosCell;
use crate::client::ReplicaConsistency;
use crate::coordinator::CoordinatorCell;
use crate::errors::{ChaosError, ChaosResult};
use crate::manager::{CreateCardRequest, CreateReplicaRequest};
use crate::pull::PullRowsRequest;
use crate::replica::{AlterReplicaRequest, ContentType, ReplicaAttributes, ReplicaMode};
use crate::storage::TableSchema;
use crate::types::{CardId, CellId, ClockTag, Era, Key, ReplicaId, RowKey, Timestamp};

fn default_true() -> bool {
    true
}

fn default_tablet_count() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct RowInput {
    pub key: RowKey,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct CoordinatorCellInput {
    pub cell_id: CellId,
    #[serde(default)]
    pub clock_tag: Option<ClockTag>,
}

/// Requests understood by `chaos-cell serve`
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CellRequest {
    CreateCard {
        #[serde(default)]
        card_id: Option<CardId>,
        #[serde(default)]
        table_path: Option<String>,
        #[serde(default)]
        clock_tag: Option<ClockTag>,
        #[serde(default)]
        options: CardOptions,
    },
    RemoveCard {
        card_id: CardId,
    },
    GetCard {
        card_id: CardId,
    },
    AttachTable {
        path: String,
        card_id: CardId,
    },
    RemoveTable {
        path: String,
    },
    /// Create a physical table in a reachable cluster
    CreateTable {
        cluster_name: String,
        path: String,
        content_type: ContentType,
        /// Ordered tables get this many tablets; sorted tables use pivots
        #[serde(default)]
        tablet_count: Option<u32>,
        #[serde(default)]
        pivots: Vec<Key>,
    },
    CreateReplica {
        card_id: CardId,
        cluster_name: String,
        replica_path: String,
        content_type: ContentType,
        mode: ReplicaMode,
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default = "default_tablet_count")]
        tablet_count: u32,
        #[serde(default = "default_true")]
        catchup: bool,
        #[serde(default)]
        expected_era: Option<Era>,
    },
    RemoveReplica {
        replica_id: ReplicaId,
        #[serde(default)]
        expected_era: Option<Era>,
    },
    AlterReplica {
        replica_id: ReplicaId,
        #[serde(default)]
        mode: Option<ReplicaMode>,
        #[serde(default)]
        enabled: Option<bool>,
        #[serde(default)]
        expected_era: Option<Era>,
    },
    ReshardReplica {
        replica_id: ReplicaId,
        pivots: Vec<Key>,
    },
    WaitForEraSettlement {
        card_id: CardId,
        era: Era,
    },
    SuspendCoordinator {
        cell_id: CellId,
    },
    ResumeCoordinator {
        cell_id: CellId,
    },
    UpdateCoordinatorCells {
        #[serde(default)]
        add: Vec<CoordinatorCellInput>,
        #[serde(default)]
        remove: Vec<CellId>,
    },
    InsertRows {
        card_id: CardId,
        rows: Vec<RowInput>,
    },
    DeleteRows {
        card_id: CardId,
        keys: Vec<RowKey>,
    },
    LookupRows {
        card_id: CardId,
        keys: Vec<RowKey>,
        #[serde(default)]
        timestamp: Option<Timestamp>,
        #[serde(default)]
        consistency: ReplicaConsistency,
    },
    SelectRows {
        card_id: CardId,
        #[serde(default)]
        timestamp: Option<Timestamp>,
        #[serde(default)]
        consistency: ReplicaConsistency,
    },
    GetInSyncReplicas {
        card_id: CardId,
        #[serde(default)]
        keys: Option<Vec<RowKey>>,
        #[serde(default)]
        timestamp: Option<Timestamp>,
    },
    PullRows {
        cluster_name: String,
        path: String,
        request: PullRowsRequest,
    },
    TrimRows {
        replica_id: ReplicaId,
        tablet_index: u32,
        trimmed_row_count: u64,
    },
    ReplicaLagTimes {
        card_id: CardId,
    },
    Describe,
    Metrics,
    SaveSnapshot,
}

impl CellRequest {
    pub fn parse(value: Value) -> ChaosResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| ChaosError::invalid_request(format!("malformed request: {}", e)))
    }
}

fn read_timestamp(cell: &ChaosCell, timestamp: Option<Timestamp>) -> Timestamp {
    timestamp.unwrap_or_else(|| cell.manager().clock().latest_timestamp())
}

/// Execute one request against the cell
pub async fn handle_request(cell: &Arc<ChaosCell>, request: CellRequest) -> ChaosResult<Value> {
    match request {
        CellRequest::CreateCard {
            card_id,
            table_path,
            clock_tag,
            options,
        } => {
            let card_id = cell.create_card(CreateCardRequest {
                card_id,
                table_path,
                table_cluster_name: Some(cell.config().cluster_name.clone()),
                clock_tag: clock_tag.or(cell.config().clock_tag),
                options,
                ..Default::default()
            })?;
            Ok(json!({ "card_id": card_id }))
        }
        CellRequest::RemoveCard { card_id } => {
            cell.remove_card(card_id).await?;
            Ok(json!({ "removed": true }))
        }
        CellRequest::GetCard { card_id } => Ok(serde_json::to_value(cell.get_card(card_id).await?)?),
        CellRequest::AttachTable { path, card_id } => {
            cell.attach_table(path, card_id)?;
            Ok(json!({ "attached": true }))
        }
        CellRequest::RemoveTable { path } => {
            let card_removed = cell.remove_table(&path).await?;
            Ok(json!({ "card_removed": card_removed }))
        }
        CellRequest::CreateTable {
            cluster_name,
            path,
            content_type,
            tablet_count,
            pivots,
        } => {
            let schema = match tablet_count {
                Some(count) => TableSchema::ordered(content_type, count)?,
                None => TableSchema::sorted(content_type, pivots)?,
            };
            let store = cell.directory().store(&cluster_name)?;
            store.create_table(&path, schema.clone()).await?;
            Ok(serde_json::to_value(schema)?)
        }
        CellRequest::CreateReplica {
            card_id,
            cluster_name,
            replica_path,
            content_type,
            mode,
            enabled,
            tablet_count,
            catchup,
            expected_era,
        } => {
            let attributes =
                ReplicaAttributes::new(cluster_name, replica_path, content_type, mode, enabled)
                    .with_tablet_count(tablet_count);
            let mut request = CreateReplicaRequest::new(attributes);
            if !catchup {
                request = request.without_catchup();
            }
            request.expected_era = expected_era;
            let (replica_id, era) = cell.create_replica_with_era(card_id, request).await?;
            if cell.config().host_replica_agents {
                cell.spawn_replica_agents(replica_id)?;
            }
            Ok(json!({ "replica_id": replica_id, "era": era }))
        }
        CellRequest::RemoveReplica {
            replica_id,
            expected_era,
        } => {
            let era = cell.remove_replica(replica_id, expected_era).await?;
            Ok(json!({ "removed": true, "era": era }))
        }
        CellRequest::AlterReplica {
            replica_id,
            mode,
            enabled,
            expected_era,
        } => {
            let request = AlterReplicaRequest {
                mode,
                enabled,
                expected_era,
            };
            let (changed, era) = cell.alter_replica_with_era(replica_id, request).await?;
            Ok(json!({ "changed": changed, "era": era }))
        }
        CellRequest::ReshardReplica { replica_id, pivots } => {
            let schema = cell.reshard_replica(replica_id, pivots).await?;
            Ok(serde_json::to_value(schema)?)
        }
        CellRequest::WaitForEraSettlement { card_id, era } => {
            let status = cell.wait_for_era_settlement(card_id, era).await?;
            Ok(json!({ "era": status.era, "settled_era": status.settled_era }))
        }
        CellRequest::SuspendCoordinator { cell_id } => {
            let changed = cell.suspend_coordinator(cell_id).await?;
            Ok(json!({ "changed": changed }))
        }
        CellRequest::ResumeCoordinator { cell_id } => {
            let changed = cell.resume_coordinator(cell_id).await?;
            Ok(json!({ "changed": changed }))
        }
        CellRequest::UpdateCoordinatorCells { add, remove } => {
            let add: Vec<CoordinatorCell> = add
                .into_iter()
                .map(|c| CoordinatorCell::new(c.cell_id, c.clock_tag))
                .collect();
            let added = cell.update_coordinator_cells(&add, &remove).await?;
            Ok(json!({ "added": added }))
        }
        CellRequest::InsertRows { card_id, rows } => {
            let rows = rows.into_iter().map(|row| (row.key, row.value)).collect();
            Ok(serde_json::to_value(cell.insert_rows(card_id, rows).await?)?)
        }
        CellRequest::DeleteRows { card_id, keys } => {
            Ok(serde_json::to_value(cell.delete_rows(card_id, keys).await?)?)
        }
        CellRequest::LookupRows {
            card_id,
            keys,
            timestamp,
            consistency,
        } => {
            let timestamp = read_timestamp(cell, timestamp);
            let rows = cell.lookup_rows(card_id, &keys, timestamp, consistency).await?;
            Ok(json!({ "timestamp": timestamp, "rows": rows }))
        }
        CellRequest::SelectRows {
            card_id,
            timestamp,
            consistency,
        } => {
            let timestamp = read_timestamp(cell, timestamp);
            let rows = cell.select_rows(card_id, timestamp, consistency).await?;
            Ok(json!({ "timestamp": timestamp, "rows": rows }))
        }
        CellRequest::GetInSyncReplicas {
            card_id,
            keys,
            timestamp,
        } => {
            let timestamp = read_timestamp(cell, timestamp);
            let replica_ids = cell
                .get_in_sync_replicas(card_id, keys.as_deref(), timestamp)
                .await?;
            Ok(json!({ "timestamp": timestamp, "replica_ids": replica_ids }))
        }
        CellRequest::PullRows {
            cluster_name,
            path,
            request,
        } => Ok(serde_json::to_value(cell.pull_rows(&cluster_name, &path, &request).await?)?),
        CellRequest::TrimRows {
            replica_id,
            tablet_index,
            trimmed_row_count,
        } => {
            let trimmed = cell
                .trim_rows(replica_id, tablet_index, trimmed_row_count)
                .await?;
            Ok(json!({ "trimmed_rows": trimmed }))
        }
        CellRequest::ReplicaLagTimes { card_id } => {
            let lags: serde_json::Map<String, Value> = cell
                .replica_lag_times(card_id)
                .await?
                .into_iter()
                .map(|(replica_id, lag_ms)| (replica_id.to_string(), json!(lag_ms)))
                .collect();
            Ok(Value::Object(lags))
        }
        CellRequest::Describe => cell.describe().await,
        CellRequest::Metrics => Ok(serde_json::to_value(cell.metrics())?),
        CellRequest::SaveSnapshot => Ok(serde_json::to_value(cell.save_snapshot().await?)?),
    }
}
