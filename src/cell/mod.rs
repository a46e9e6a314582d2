//! # Chaos Cell
//!
//! A chaos cell owns replication cards, drives their eras through the
//! coordinator cells and hosts the pullers and tablet observers of the
//! replicas it can reach. Its state survives restarts through the cell
//! snapshot in its data directory.

mod chaos_cell;
mod config;

pub use chaos_cell::ChaosCell;
pub use config::{CellConfig, CoordinatorCellConfig};
