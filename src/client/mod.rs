//! # Client Entry Points
//!
//! Row reads and writes against the replicas of a card.
//!
//! - Writes are routed by the settled write mode of each replica and need
//!   a coordinator with a granted shortcut plus a settled sync queue
//! - Reads pick a data replica; `ReplicaConsistency::Sync` restricts them
//!   to replicas in sync at the read timestamp

mod chaos_client;
mod in_sync;
mod transaction;

pub use chaos_client::{ChaosClient, ReplicaConsistency, WriteResult};
pub use in_sync::{get_in_sync_replicas, is_in_sync};
pub use transaction::Transaction;
