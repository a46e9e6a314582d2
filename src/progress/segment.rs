//! Progress segment

use serde::{Deserialize, Serialize};

use crate::types::{Key, Timestamp};

/// Segment `[lower_key, next segment's lower_key)` replicated up to
/// `timestamp`. The last segment ends at the progress upper key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSegment {
    pub lower_key: Key,
    pub timestamp: Timestamp,
}

impl ProgressSegment {
    pub fn new(lower_key: Key, timestamp: Timestamp) -> Self {
        Self {
            lower_key,
            timestamp,
        }
    }
}
