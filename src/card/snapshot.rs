//! Immutable card view

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::replication_card::{CardOptions, ReplicationCard};
use super::shortcut::ShortcutState;
use crate::errors::{ChaosError, ChaosResult};
use crate::replica::TableReplica;
use crate::types::{CardId, CellId, ClockTag, Era, ReplicaId};

/// Consistent single-era view of a card
///
/// Taken under the card lock; readers never observe a partially applied
/// topology change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSnapshot {
    pub card_id: CardId,
    pub era: Era,
    pub settled_era: Option<Era>,
    pub replicas: BTreeMap<ReplicaId, TableReplica>,
    pub coordinator_cell_ids: Vec<CellId>,
    pub shortcuts: BTreeMap<CellId, ShortcutState>,
    pub clock_tag: Option<ClockTag>,
    pub table_path: Option<String>,
    pub options: CardOptions,
}

impl CardSnapshot {
    pub(super) fn from_card(card: &ReplicationCard) -> Self {
        Self {
            card_id: card.card_id(),
            era: card.era(),
            settled_era: card.settled_era(),
            replicas: card.replicas().clone(),
            coordinator_cell_ids: card.coordinator_cell_ids(),
            shortcuts: card.coordinators().clone(),
            clock_tag: card.clock_tag(),
            table_path: card.table_path().map(str::to_string),
            options: card.options().clone(),
        }
    }

    pub fn replica(&self, replica_id: ReplicaId) -> ChaosResult<&TableReplica> {
        self.replicas
            .get(&replica_id)
            .ok_or(ChaosError::NoSuchReplica(replica_id))
    }

    pub fn is_settled(&self) -> bool {
        self.settled_era.map_or(false, |settled| settled >= self.era)
    }
}
