//! Cluster name to storage engine mapping

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::store::ReplicaStore;
use crate::errors::{ChaosError, ChaosResult};

/// Storage engines reachable from this cell, by cluster name
#[derive(Default)]
pub struct ClusterDirectory {
    stores: RwLock<HashMap<String, Arc<dyn ReplicaStore>>>,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the store of a cluster, replacing any previous one
    pub fn register(&self, store: Arc<dyn ReplicaStore>) -> ChaosResult<()> {
        let mut stores = self
            .stores
            .write()
            .map_err(|_| ChaosError::Internal("cluster directory lock poisoned".into()))?;
        stores.insert(store.cluster_name().to_string(), store);
        Ok(())
    }

    /// Store of a cluster; unknown clusters are unavailable
    pub fn store(&self, cluster_name: &str) -> ChaosResult<Arc<dyn ReplicaStore>> {
        let stores = self
            .stores
            .read()
            .map_err(|_| ChaosError::Internal("cluster directory lock poisoned".into()))?;
        stores
            .get(cluster_name)
            .cloned()
            .ok_or_else(|| ChaosError::ClusterUnavailable(cluster_name.to_string()))
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stores
            .read()
            .map(|stores| stores.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
