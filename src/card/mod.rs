//! # Replication Cards
//!
//! The metadata record of one logical table: its replicas, its era and
//! the coordinator cells currently allowed to route writes for it.

mod replication_card;
mod shortcut;
mod snapshot;

pub use replication_card::{CardOptions, ReplicationCard};
pub use shortcut::ShortcutState;
pub use snapshot::CardSnapshot;
