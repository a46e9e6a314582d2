//! Identifiers for cards, replicas, cells and tables

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Replication card identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(pub Uuid);

impl CardId {
    /// Generate a fresh random card id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CardId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Chaos or coordinator cell identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub Uuid);

impl CellId {
    /// Generate a fresh random cell id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CellId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Replicated table identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub Uuid);

impl TableId {
    /// Generate a fresh random table id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica identifier
///
/// Derived from the owning card id plus a per-card index, so the card of
/// any replica can be recovered from the replica id alone. Serialized as
/// `"<card>/<index>"` so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId {
    pub card_id: CardId,
    pub index: u32,
}

impl ReplicaId {
    pub fn new(card_id: CardId, index: u32) -> Self {
        Self { card_id, index }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.card_id, self.index)
    }
}

impl FromStr for ReplicaId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (card, index) = s
            .split_once('/')
            .ok_or_else(|| format!("malformed replica id {:?}", s))?;
        let card_id = card
            .parse::<CardId>()
            .map_err(|e| format!("malformed replica id {:?}: {}", s, e))?;
        let index = index
            .parse::<u32>()
            .map_err(|e| format!("malformed replica id {:?}: {}", s, e))?;
        Ok(Self { card_id, index })
    }
}

impl Serialize for ReplicaId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReplicaId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_id_carries_card() {
        let card_id = CardId::generate();
        let replica_id = ReplicaId::new(card_id, 3);
        let parsed: ReplicaId = replica_id.to_string().parse().unwrap();
        assert_eq!(parsed, replica_id);
        assert_eq!(parsed.card_id, card_id);
    }

    #[test]
    fn test_replica_id_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(ReplicaId::new(CardId::generate(), 1), "queue");
        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<ReplicaId, String> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn test_malformed_replica_id() {
        assert!("not-a-replica".parse::<ReplicaId>().is_err());
        assert!("00000000-0000-0000-0000-000000000000/x".parse::<ReplicaId>().is_err());
    }
}
