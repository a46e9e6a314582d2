//! # Pull Replication
//!
//! Asynchronous replicas catch up by pulling change rows from enabled
//! queue replicas. A pull never moves the consumer cursor past a point
//! whose rows were not all returned, and queue rows are only trimmed
//! once every other replica has replicated them.
//!
//! - `pull_rows` serves one pull request from a queue replica
//! - `ReplicaPuller` drives pulls for one consumer replica
//! - `trim_rows` and `trim_replicated_rows` drop consumed queue rows

mod order;
mod puller;
mod rows;
mod trim;

pub use order::{is_ordered_by_timestamp, order_by_timestamp};
pub use puller::ReplicaPuller;
pub use rows::{pull_rows, PullRowsRequest, PullRowsResponse, DEFAULT_MAX_PULL_ROWS};
pub use trim::{trim_replicated_rows, trim_rows};
