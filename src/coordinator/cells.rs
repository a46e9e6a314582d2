//! Coordinator cell set
//!
//! The cell-wide list of coordinator cells and the subset currently
//! suspended. Suspension never leaves the set without an active cell.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ChaosError, ChaosResult};
use crate::types::{CellId, ClockTag};

/// A coordinator cell and the clock authority it uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorCell {
    pub cell_id: CellId,
    #[serde(default)]
    pub clock_tag: Option<ClockTag>,
}

impl CoordinatorCell {
    pub fn new(cell_id: CellId, clock_tag: Option<ClockTag>) -> Self {
        Self { cell_id, clock_tag }
    }

    /// Whether the cell may coordinate a card bound to `card_clock`
    pub fn is_compatible_with(&self, card_clock: Option<ClockTag>) -> bool {
        match (card_clock, self.clock_tag) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    }
}

/// Persisted coordinator state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub cells: BTreeMap<CellId, Option<ClockTag>>,
    pub suspended: BTreeMap<CellId, DateTime<Utc>>,
}

impl CoordinatorState {
    fn active_count(&self) -> usize {
        self.cells
            .keys()
            .filter(|cell_id| !self.suspended.contains_key(*cell_id))
            .count()
    }
}

#[derive(Debug, Default)]
pub struct CoordinatorManager {
    state: RwLock<CoordinatorState>,
}

impl CoordinatorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: CoordinatorState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> ChaosResult<CoordinatorState> {
        Ok(self.read()?.clone())
    }

    /// Add and remove coordinator cells
    ///
    /// Returns the cells that were newly added.
    pub fn update_cells(
        &self,
        add: &[CoordinatorCell],
        remove: &[CellId],
    ) -> ChaosResult<Vec<CellId>> {
        let mut state = self.write()?;
        let mut next = state.clone();
        for cell_id in remove {
            next.cells.remove(cell_id);
            next.suspended.remove(cell_id);
        }
        let mut added = Vec::new();
        for cell in add {
            if next.cells.insert(cell.cell_id, cell.clock_tag).is_none() {
                added.push(cell.cell_id);
            }
        }
        if let Some(last) = remove.last() {
            if next.active_count() == 0 && state.active_count() > 0 {
                return Err(ChaosError::LastActiveCoordinator(*last));
            }
        }
        *state = next;
        Ok(added)
    }

    /// Suspend a coordinator cell; returns false if it already was
    pub fn suspend(&self, cell_id: CellId) -> ChaosResult<bool> {
        let mut state = self.write()?;
        if !state.cells.contains_key(&cell_id) {
            return Err(ChaosError::invalid_request(format!(
                "{} is not a coordinator cell",
                cell_id
            )));
        }
        if state.suspended.contains_key(&cell_id) {
            return Ok(false);
        }
        if state.active_count() <= 1 {
            return Err(ChaosError::LastActiveCoordinator(cell_id));
        }
        state.suspended.insert(cell_id, Utc::now());
        Ok(true)
    }

    /// Resume a suspended cell; returns false if it was not suspended
    pub fn resume(&self, cell_id: CellId) -> ChaosResult<bool> {
        Ok(self.write()?.suspended.remove(&cell_id).is_some())
    }

    pub fn is_suspended(&self, cell_id: CellId) -> bool {
        self.read()
            .map_or(false, |state| state.suspended.contains_key(&cell_id))
    }

    /// Whether the cell is no longer allowed to hold shortcuts
    pub fn is_retired(&self, cell_id: CellId) -> bool {
        self.read().map_or(false, |state| {
            !state.cells.contains_key(&cell_id) || state.suspended.contains_key(&cell_id)
        })
    }

    /// Active cells allowed to coordinate a card bound to `card_clock`
    pub fn active_cells(&self, card_clock: Option<ClockTag>) -> ChaosResult<Vec<CellId>> {
        let state = self.read()?;
        Ok(state
            .cells
            .iter()
            .filter(|(cell_id, _)| !state.suspended.contains_key(*cell_id))
            .map(|(cell_id, clock_tag)| CoordinatorCell::new(*cell_id, *clock_tag))
            .filter(|cell| cell.is_compatible_with(card_clock))
            .map(|cell| cell.cell_id)
            .collect())
    }

    pub fn suspended_cells(&self) -> ChaosResult<Vec<(CellId, DateTime<Utc>)>> {
        Ok(self
            .read()?
            .suspended
            .iter()
            .map(|(cell_id, since)| (*cell_id, *since))
            .collect())
    }

    fn read(&self) -> ChaosResult<RwLockReadGuard<'_, CoordinatorState>> {
        self.state
            .read()
            .map_err(|_| ChaosError::Internal("coordinator state lock poisoned".into()))
    }

    fn write(&self) -> ChaosResult<RwLockWriteGuard<'_, CoordinatorState>> {
        self.state
            .write()
            .map_err(|_| ChaosError::Internal("coordinator state lock poisoned".into()))
    }
}
