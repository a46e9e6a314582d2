//! Row keys and key-space bounds

use std::fmt;

use serde::{Deserialize, Serialize};

/// One component of a composite row key
///
/// Ordering follows variant order first, then value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPart {
    Null,
    Int64(i64),
    Uint64(u64),
    String(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "#"),
            KeyPart::Int64(v) => write!(f, "{}", v),
            KeyPart::Uint64(v) => write!(f, "{}u", v),
            KeyPart::String(v) => write!(f, "{:?}", v),
        }
    }
}

/// Composite row key compared lexicographically
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(pub Vec<KeyPart>);

impl RowKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Single int64 column key
    pub fn int(value: i64) -> Self {
        Self(vec![KeyPart::Int64(value)])
    }

    /// Single string column key
    pub fn string(value: impl Into<String>) -> Self {
        Self(vec![KeyPart::String(value.into())])
    }

    /// Key under which an ordered table tracks progress of one tablet
    pub fn tablet(tablet_index: u32) -> Self {
        Self(vec![KeyPart::Int64(i64::from(tablet_index))])
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, "]")
    }
}

/// A point in the key space, extended with both infinities
///
/// `Min < Row(_) < Max` for every row key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    Min,
    Row(RowKey),
    Max,
}

impl Key {
    /// Key for a row; the empty row key denotes the start of the key space
    pub fn row(key: RowKey) -> Self {
        if key.0.is_empty() {
            Key::Min
        } else {
            Key::Row(key)
        }
    }

    pub fn int(value: i64) -> Self {
        Key::Row(RowKey::int(value))
    }

    pub fn is_min(&self) -> bool {
        matches!(self, Key::Min)
    }

    pub fn is_max(&self) -> bool {
        matches!(self, Key::Max)
    }
}

impl From<RowKey> for Key {
    fn from(key: RowKey) -> Self {
        Key::row(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Min => write!(f, "<min>"),
            Key::Row(key) => write!(f, "{}", key),
            Key::Max => write!(f, "<max>"),
        }
    }
}
