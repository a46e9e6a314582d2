//! # Replication Progress
//!
//! Piecewise-constant map from key ranges to the timestamp up to which a
//! replica has all changes for that range.
//!
//! Progress only ever grows: every mutation takes the pointwise maximum of
//! the old and the new value.

mod replication;
mod segment;

pub use replication::ReplicationProgress;
pub use segment::ProgressSegment;
