//! # Table Replicas
//!
//! One physical copy of a replicated table: where it lives, what it
//! stores, how writes reach it, and how far it has replicated.
//!
//! # Write mode
//!
//! `write_mode` is derived, never stored: a replica is written directly
//! only when it is an enabled synchronous data replica. While a mode or
//! state change is in flight the previous stable values stay in force.

mod history;
mod mode;
mod table_replica;

pub use history::ReplicaHistoryItem;
pub use mode::{write_mode, ContentType, ReplicaMode, ReplicaState, WriteMode};
pub use table_replica::{AlterReplicaRequest, ReplicaAttributes, TableReplica};
