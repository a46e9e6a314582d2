//! Logical table nodes referencing cards
//!
//! A table created together with its card owns it. Views and copies that
//! merely attach to an existing card do not.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::errors::{ChaosError, ChaosResult};
use crate::types::CardId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNode {
    pub path: String,
    pub card_id: CardId,
    pub owns_card: bool,
}

#[derive(Debug, Default)]
pub struct TableNodeRegistry {
    nodes: RwLock<BTreeMap<String, TableNode>>,
}

impl TableNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: TableNode) -> ChaosResult<()> {
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| ChaosError::Internal("table node lock poisoned".into()))?;
        if nodes.contains_key(&node.path) {
            return Err(ChaosError::invalid_request(format!(
                "table node {} already exists",
                node.path
            )));
        }
        nodes.insert(node.path.clone(), node);
        Ok(())
    }

    /// Remove a node; returns the card to destroy if the node owned it
    pub fn remove(&self, path: &str) -> ChaosResult<Option<CardId>> {
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| ChaosError::Internal("table node lock poisoned".into()))?;
        let node = nodes
            .remove(path)
            .ok_or_else(|| ChaosError::invalid_request(format!("no table node {}", path)))?;
        Ok(node.owns_card.then_some(node.card_id))
    }

    pub fn get(&self, path: &str) -> Option<TableNode> {
        self.nodes.read().ok()?.get(path).cloned()
    }

    pub fn nodes(&self) -> Vec<TableNode> {
        self.nodes
            .read()
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default()
    }
}
