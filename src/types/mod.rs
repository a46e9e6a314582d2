//! # Core Types
//!
//! Identifiers, hybrid timestamps and row keys shared by every chaos
//! subsystem.

mod ids;
mod key;
mod timestamp;

pub use ids::{CardId, CellId, ReplicaId, TableId};
pub use key::{Key, KeyPart, RowKey};
pub use timestamp::{ClockTag, Era, Timestamp, INITIAL_ERA};
