//! # Cell Snapshots
//!
//! Durable copy of the state a chaos cell owns: replication cards with
//! their replicas, progress and history, the coordinator cell set and the
//! table nodes referencing cards.
//!
//! # Design Principles
//!
//! - Atomic visibility (temp file, fsync, rename)
//! - Explicit integrity verification (CRC32 over the state payload)
//! - A corrupted snapshot is never partially loaded

mod checksum;
mod manifest;
mod state;

pub use checksum::{compute_checksum, format_checksum, parse_checksum};
pub use manifest::{SnapshotManifest, SNAPSHOT_FORMAT_VERSION};
pub use state::{load_snapshot, save_snapshot, snapshot_path, CellSnapshot};
