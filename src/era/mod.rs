//! # Era Advancement
//!
//! A card moves to a new era on every topology change: replicas added,
//! removed or altered, and coordinators suspended, resumed or replaced.
//! Writers keep using the previous settled era until every tablet of
//! every replica has acknowledged the new one.
//!
//! - `EraEngine` commences eras and moves coordinator shortcuts
//! - `wait_for_era_settlement` lets callers await settlement with a timeout
//! - `TabletObserver` acknowledges eras on behalf of replica tablets

mod engine;
mod observer;
mod settlement;

pub use engine::EraEngine;
pub use observer::TabletObserver;
pub use settlement::{wait_for_era_settlement, SettlementBackoff};
