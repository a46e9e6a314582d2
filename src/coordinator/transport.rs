//! Shortcut transport
//!
//! A shortcut authorizes a coordinator cell to route writes for a card
//! during one era. Shortcuts are granted after an era is commenced and
//! revoked before the next one.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{ChaosError, ChaosResult};
use crate::types::{CardId, CellId, Era};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantShortcutsRequest {
    pub card_id: CardId,
    pub era: Era,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantShortcutsResponse {
    /// The coordinator refused because it is suspended
    pub suspended: bool,
}

/// RPCs from a chaos cell to coordinator cells
#[async_trait]
pub trait CoordinatorTransport: Send + Sync {
    async fn grant_shortcuts(
        &self,
        cell_id: CellId,
        request: GrantShortcutsRequest,
    ) -> ChaosResult<GrantShortcutsResponse>;

    async fn revoke_shortcuts(&self, cell_id: CellId, card_id: CardId) -> ChaosResult<()>;
}

#[derive(Debug, Default)]
struct LocalCoordinators {
    unreachable: HashSet<CellId>,
    suspended: HashSet<CellId>,
    shortcuts: HashMap<CellId, HashMap<CardId, Era>>,
}

/// In-process coordinators with injectable failures
#[derive(Debug, Default)]
pub struct LocalCoordinatorTransport {
    inner: Mutex<LocalCoordinators>,
}

impl LocalCoordinatorTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make RPCs to `cell_id` fail (or succeed again)
    pub fn set_unreachable(&self, cell_id: CellId, unreachable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            if unreachable {
                inner.unreachable.insert(cell_id);
            } else {
                inner.unreachable.remove(&cell_id);
            }
        }
    }

    /// Make `cell_id` answer grants as a suspended coordinator
    pub fn set_suspended(&self, cell_id: CellId, suspended: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            if suspended {
                inner.suspended.insert(cell_id);
            } else {
                inner.suspended.remove(&cell_id);
            }
        }
    }

    /// Cards `cell_id` currently holds shortcuts for, with their era
    pub fn shortcuts_of(&self, cell_id: CellId) -> HashMap<CardId, Era> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.shortcuts.get(&cell_id).cloned())
            .unwrap_or_default()
    }

    fn with_reachable<T>(
        &self,
        cell_id: CellId,
        call: impl FnOnce(&mut LocalCoordinators) -> T,
    ) -> ChaosResult<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChaosError::Internal("coordinator transport lock poisoned".into()))?;
        if inner.unreachable.contains(&cell_id) {
            return Err(ChaosError::ClusterUnavailable(format!("cell {}", cell_id)));
        }
        Ok(call(&mut inner))
    }
}

#[async_trait]
impl CoordinatorTransport for LocalCoordinatorTransport {
    async fn grant_shortcuts(
        &self,
        cell_id: CellId,
        request: GrantShortcutsRequest,
    ) -> ChaosResult<GrantShortcutsResponse> {
        self.with_reachable(cell_id, |inner| {
            if inner.suspended.contains(&cell_id) {
                return GrantShortcutsResponse { suspended: true };
            }
            inner
                .shortcuts
                .entry(cell_id)
                .or_default()
                .insert(request.card_id, request.era);
            GrantShortcutsResponse { suspended: false }
        })
    }

    async fn revoke_shortcuts(&self, cell_id: CellId, card_id: CardId) -> ChaosResult<()> {
        self.with_reachable(cell_id, |inner| {
            if let Some(cards) = inner.shortcuts.get_mut(&cell_id) {
                cards.remove(&card_id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_and_revoke() {
        let transport = LocalCoordinatorTransport::new();
        let cell_id = CellId::generate();
        let card_id = CardId::generate();

        let response = transport
            .grant_shortcuts(cell_id, GrantShortcutsRequest { card_id, era: 2 })
            .await
            .unwrap();
        assert!(!response.suspended);
        assert_eq!(transport.shortcuts_of(cell_id).get(&card_id), Some(&2));

        transport.revoke_shortcuts(cell_id, card_id).await.unwrap();
        assert!(transport.shortcuts_of(cell_id).is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let transport = LocalCoordinatorTransport::new();
        let cell_id = CellId::generate();
        let request = GrantShortcutsRequest {
            card_id: CardId::generate(),
            era: 1,
        };

        transport.set_suspended(cell_id, true);
        assert!(transport.grant_shortcuts(cell_id, request).await.unwrap().suspended);
        assert!(transport.shortcuts_of(cell_id).is_empty());

        transport.set_unreachable(cell_id, true);
        let err = transport.grant_shortcuts(cell_id, request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
