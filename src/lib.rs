//! chaos-replication - coordination of chaos replicated tables
//!
//! A chaos replicated table is one logical table stored as several
//! replicas in independent clusters. Its replication card lists the
//! replicas with their mode, state, progress and history, and moves
//! through numbered eras so every replica agrees on who is written
//! directly and who catches up by pulling from queues.

pub mod card;
pub mod cell;
pub mod cli;
pub mod client;
pub mod clock;
pub mod coordinator;
pub mod era;
pub mod errors;
pub mod manager;
pub mod observability;
pub mod progress;
pub mod pull;
pub mod replica;
pub mod snapshot;
pub mod storage;
pub mod timeout;
pub mod types;
