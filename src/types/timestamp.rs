//! Hybrid logical timestamps and replication eras

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replication era number
///
/// Monotonically increasing version of a card's topology.
pub type Era = u64;

/// Era of a freshly created card, before any era has been commenced
pub const INITIAL_ERA: Era = 0;

/// Number of low bits reserved for the logical counter
const LOGICAL_BITS: u32 = 18;

/// Hybrid logical timestamp
///
/// The high bits hold wall-clock milliseconds, the low bits a logical
/// counter that disambiguates timestamps generated within one millisecond.
/// Ordering is plain integer ordering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Smallest timestamp, precedes every committed write
    pub const MIN: Timestamp = Timestamp(0);

    /// Largest timestamp, never generated by a clock
    pub const MAX: Timestamp = Timestamp(0x3fff_ffff_ffff_ff00);

    /// Build a timestamp from physical milliseconds and a logical counter
    pub fn from_parts(physical_ms: u64, logical: u64) -> Self {
        Self((physical_ms << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1)))
    }

    /// Raw value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Physical component in milliseconds
    pub fn physical_ms(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Next representable timestamp, saturating at MAX
    pub fn next(&self) -> Self {
        if *self >= Self::MAX {
            Self::MAX
        } else {
            Self(self.0 + 1)
        }
    }

    /// Previous representable timestamp, saturating at MIN
    pub fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Wall-clock distance to a later timestamp in milliseconds
    pub fn millis_until(&self, later: Timestamp) -> u64 {
        later.physical_ms().saturating_sub(self.physical_ms())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Identifies the clock authority that generated a timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClockTag(pub u16);

impl fmt::Display for ClockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
