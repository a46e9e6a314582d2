//! Cell configuration
//!
//! Loaded from a JSON file. Every field except the identity of the cell
//! has a default:
//!
//! ```json
//! {
//!   "cell_id": "8f0c3c52-8a5e-4a43-9d55-3f6f3c1f6f0e",
//!   "cluster_name": "primary",
//!   "data_dir": "./chaos-data",
//!   "clock_tag": 1
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorCell;
use crate::era::SettlementBackoff;
use crate::errors::{ChaosError, ChaosResult};
use crate::manager::{ManagerOptions, DEFAULT_MAX_REPLICAS_PER_CARD};
use crate::pull::DEFAULT_MAX_PULL_ROWS;
use crate::types::{CellId, ClockTag};

/// Coordinator cell entry of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorCellConfig {
    pub cell_id: CellId,
    #[serde(default)]
    pub clock_tag: Option<ClockTag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellConfig {
    pub cell_id: CellId,

    /// Cluster hosting this cell
    pub cluster_name: String,

    /// Directory holding the cell snapshot
    pub data_dir: PathBuf,

    /// Clock authority this cell expects timestamps from
    #[serde(default)]
    pub clock_tag: Option<ClockTag>,

    #[serde(default = "default_max_replicas_per_card")]
    pub max_replicas_per_card: usize,

    /// Period of the stalled card investigation
    #[serde(default = "default_era_commencing_period_ms")]
    pub era_commencing_period_ms: u64,

    /// Timeout of every coordinator and storage request
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_settlement_backoff_ms")]
    pub settlement_backoff_ms: u64,

    #[serde(default = "default_settlement_backoff_max_ms")]
    pub settlement_backoff_max_ms: u64,

    /// How long era settlement is awaited before `EraNotSettled`
    #[serde(default = "default_settlement_timeout_ms")]
    pub settlement_timeout_ms: u64,

    /// Row budget of one pull
    #[serde(default = "default_max_pull_rows")]
    pub max_pull_rows: usize,

    #[serde(default = "default_pull_period_ms")]
    pub pull_period_ms: u64,

    /// Period of history expiry and queue trimming
    #[serde(default = "default_maintenance_period_ms")]
    pub maintenance_period_ms: u64,

    /// Replica history younger than this is kept
    #[serde(default = "default_replica_history_retention_ms")]
    pub replica_history_retention_ms: u64,

    #[serde(default = "default_true")]
    pub enable_mutation_logging: bool,

    /// Trim queue rows once every replica has replicated them
    #[serde(default = "default_true")]
    pub enable_auto_trim: bool,

    /// Run pullers and tablet observers for replicas on reachable clusters
    #[serde(default = "default_true")]
    pub host_replica_agents: bool,

    /// Coordinator cells; the cell itself when empty
    #[serde(default)]
    pub coordinator_cells: Vec<CoordinatorCellConfig>,

    /// Clusters whose storage this cell can reach
    #[serde(default)]
    pub clusters: Vec<String>,
}

fn default_max_replicas_per_card() -> usize {
    DEFAULT_MAX_REPLICAS_PER_CARD
}
fn default_era_commencing_period_ms() -> u64 {
    1000
}
fn default_rpc_timeout_ms() -> u64 {
    5000
}
fn default_settlement_backoff_ms() -> u64 {
    50
}
fn default_settlement_backoff_max_ms() -> u64 {
    1000
}
fn default_settlement_timeout_ms() -> u64 {
    30_000
}
fn default_max_pull_rows() -> usize {
    DEFAULT_MAX_PULL_ROWS
}
fn default_pull_period_ms() -> u64 {
    100
}
fn default_maintenance_period_ms() -> u64 {
    10_000
}
fn default_replica_history_retention_ms() -> u64 {
    3_600_000
}
fn default_true() -> bool {
    true
}

impl CellConfig {
    /// Configuration with defaults for everything but the identity
    pub fn new(cell_id: CellId, cluster_name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            cell_id,
            cluster_name: cluster_name.into(),
            data_dir: data_dir.into(),
            clock_tag: None,
            max_replicas_per_card: default_max_replicas_per_card(),
            era_commencing_period_ms: default_era_commencing_period_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            settlement_backoff_ms: default_settlement_backoff_ms(),
            settlement_backoff_max_ms: default_settlement_backoff_max_ms(),
            settlement_timeout_ms: default_settlement_timeout_ms(),
            max_pull_rows: default_max_pull_rows(),
            pull_period_ms: default_pull_period_ms(),
            maintenance_period_ms: default_maintenance_period_ms(),
            replica_history_retention_ms: default_replica_history_retention_ms(),
            enable_mutation_logging: true,
            enable_auto_trim: true,
            host_replica_agents: true,
            coordinator_cells: Vec::new(),
            clusters: Vec::new(),
        }
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ChaosResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ChaosError::invalid_request(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let config: CellConfig = serde_json::from_str(&content)
            .map_err(|e| ChaosError::invalid_request(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ChaosResult<()> {
        if self.cluster_name.is_empty() {
            return Err(ChaosError::invalid_request("cluster_name must not be empty"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ChaosError::invalid_request("data_dir must not be empty"));
        }
        let positive = [
            ("max_replicas_per_card", self.max_replicas_per_card as u64),
            ("era_commencing_period_ms", self.era_commencing_period_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("settlement_backoff_ms", self.settlement_backoff_ms),
            ("settlement_timeout_ms", self.settlement_timeout_ms),
            ("max_pull_rows", self.max_pull_rows as u64),
            ("pull_period_ms", self.pull_period_ms),
            ("maintenance_period_ms", self.maintenance_period_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ChaosError::invalid_request(format!("{} must be > 0", name)));
        }
        if self.settlement_backoff_max_ms < self.settlement_backoff_ms {
            return Err(ChaosError::invalid_request(
                "settlement_backoff_max_ms must not be below settlement_backoff_ms",
            ));
        }
        for cell in &self.coordinator_cells {
            if let (Some(expected), Some(actual)) = (self.clock_tag, cell.clock_tag) {
                if expected != actual {
                    return Err(ChaosError::ClockMismatch {
                        expected: Some(expected),
                        actual: Some(actual),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            max_replicas_per_card: self.max_replicas_per_card,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_millis(self.settlement_timeout_ms)
    }

    pub fn settlement_backoff(&self) -> SettlementBackoff {
        SettlementBackoff {
            initial: Duration::from_millis(self.settlement_backoff_ms),
            max: Duration::from_millis(self.settlement_backoff_max_ms),
        }
    }

    pub fn era_commencing_period(&self) -> Duration {
        Duration::from_millis(self.era_commencing_period_ms)
    }

    pub fn pull_period(&self) -> Duration {
        Duration::from_millis(self.pull_period_ms)
    }

    pub fn maintenance_period(&self) -> Duration {
        Duration::from_millis(self.maintenance_period_ms)
    }

    /// Configured coordinator cells, or this cell alone
    pub fn coordinator_cells(&self) -> Vec<CoordinatorCell> {
        if self.coordinator_cells.is_empty() {
            return vec![CoordinatorCell::new(self.cell_id, self.clock_tag)];
        }
        self.coordinator_cells
            .iter()
            .map(|c| CoordinatorCell::new(c.cell_id, c.clock_tag))
            .collect()
    }

    /// Configured clusters, always including the cell's own
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names = self.clusters.clone();
        if !names.contains(&self.cluster_name) {
            names.insert(0, self.cluster_name.clone());
        }
        names
    }
}
