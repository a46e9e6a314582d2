//! # Replica Storage
//!
//! Narrow interface to the per-cluster storage engine that physically
//! hosts replica tables, plus an in-memory implementation.
//!
//! Data tables keep every row version keyed by commit timestamp, so
//! applying the same replicated row twice is harmless. Queue tables keep
//! an append-only, trimmable log per tablet.

mod directory;
mod memory;
mod row;
mod store;

pub use directory::ClusterDirectory;
pub use memory::MemoryReplicaStore;
pub use row::{ChangeKind, ReplicationRow, Row, RowChange, TableKind, TableSchema, TabletDescriptor};
pub use store::ReplicaStore;
