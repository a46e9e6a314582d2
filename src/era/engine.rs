//! Era advancement engine
//!
//! Moving a card to a new era takes three steps:
//! 1. Every shortcut is revoked concurrently, outside the card lock
//! 2. The era is commenced under the card lock with a fresh timestamp
//! 3. Shortcuts are granted to the active coordinators, outside the lock
//!
//! A step that fails leaves the card pending; the periodic investigation
//! pass picks it up again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::card::ReplicationCard;
use crate::coordinator::{CoordinatorCell, CoordinatorManager, CoordinatorTransport, GrantShortcutsRequest};
use crate::errors::{ChaosError, ChaosResult};
use crate::manager::ChaosManager;
use crate::observability::{log_event_with_fields, log_warning, Event, ObservationScope};
use crate::timeout::with_timeout;
use crate::types::{CardId, CellId, Era};

pub struct EraEngine {
    manager: Arc<ChaosManager>,
    coordinators: Arc<CoordinatorManager>,
    transport: Arc<dyn CoordinatorTransport>,
    rpc_timeout: Duration,
}

impl EraEngine {
    pub fn new(
        manager: Arc<ChaosManager>,
        coordinators: Arc<CoordinatorManager>,
        transport: Arc<dyn CoordinatorTransport>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            coordinators,
            transport,
            rpc_timeout,
        }
    }

    pub fn coordinators(&self) -> &Arc<CoordinatorManager> {
        &self.coordinators
    }

    // =========================================================================
    // ERA ADVANCEMENT
    // =========================================================================

    /// Commence a new era if the card needs one, then grant shortcuts
    ///
    /// Returns the era commenced by this call, if any.
    pub async fn advance_card(&self, card_id: CardId) -> ChaosResult<Option<Era>> {
        let card_field = card_id.to_string();
        let scope = ObservationScope::with_fields("era_advance", &[("card_id", &card_field)]);

        let result = match self.commence_era(card_id).await {
            Ok(era) => self.grant_pending_shortcuts(card_id).await.map(|_| era),
            Err(err) => Err(err),
        };

        match &result {
            Ok(era) => scope.complete_with_fields(&[(
                "era",
                &era.map_or_else(|| "-".to_string(), |e| e.to_string()),
            )]),
            Err(err) => scope.fail(&err.to_string()),
        }
        result
    }

    async fn commence_era(&self, card_id: CardId) -> ChaosResult<Option<Era>> {
        let entry = self.manager.card_entry(card_id)?;
        let card_field = card_id.to_string();

        let revoking = {
            let mut card = entry.lock().await;
            if !card.needs_new_era() {
                return Ok(None);
            }
            if !card.has_sync_queue_after_commence() {
                log_event_with_fields(
                    Event::EraCommenceDeferred,
                    &[("card_id", &card_field), ("reason", "no sync queue")],
                );
                return Ok(None);
            }
            let revoking = card.begin_revoke();
            entry.publish(&card);
            revoking
        };

        let outcomes = join_all(
            revoking
                .iter()
                .map(|cell_id| async move { (*cell_id, self.revoke(card_id, *cell_id).await) }),
        )
        .await;
        let mut revoked = 0;
        if outcomes.iter().any(|(_, done)| *done) {
            let mut card = entry.lock().await;
            for (cell_id, done) in outcomes {
                if done && card.finish_revoke(cell_id) {
                    revoked += 1;
                }
            }
            entry.publish(&card);
        }
        if !revoking.is_empty() {
            log_event_with_fields(
                Event::ShortcutsRevoked,
                &[
                    ("card_id", &card_field),
                    ("revoked", &revoked.to_string()),
                    ("requested", &revoking.len().to_string()),
                ],
            );
        }

        let mut card = entry.lock().await;
        if !card.coordinators().is_empty() {
            log_event_with_fields(
                Event::EraCommenceDeferred,
                &[("card_id", &card_field), ("reason", "shortcuts not revoked")],
            );
            return Ok(None);
        }
        if !card.needs_new_era() || !card.has_sync_queue_after_commence() {
            return Ok(None);
        }

        let timestamp = self.manager.clock().generate_timestamp();
        let cells = self.coordinators.active_cells(card.clock_tag())?;
        let era = card.commence_new_era(timestamp, &cells)?;
        entry.publish(&card);
        drop(card);

        self.manager.metrics().increment_eras_commenced();
        log_event_with_fields(
            Event::EraCommenced,
            &[
                ("card_id", &card_field),
                ("era", &era.to_string()),
                ("timestamp", &timestamp.to_string()),
                ("coordinators", &cells.len().to_string()),
            ],
        );
        Ok(Some(era))
    }

    /// Revoke one shortcut; retired cells are dropped even if unreachable
    async fn revoke(&self, card_id: CardId, cell_id: CellId) -> bool {
        let call = self.transport.revoke_shortcuts(cell_id, card_id);
        match with_timeout("revoke_shortcuts", self.rpc_timeout, call).await {
            Ok(()) => true,
            Err(err) => {
                self.record_rpc_failure(card_id, cell_id, "revoke", &err);
                self.coordinators.is_retired(cell_id)
            }
        }
    }

    /// Grant shortcuts still in the granting state
    ///
    /// Returns the number of shortcuts granted.
    pub async fn grant_pending_shortcuts(&self, card_id: CardId) -> ChaosResult<usize> {
        let entry = self.manager.card_entry(card_id)?;
        let (era, cells) = {
            let card = entry.lock().await;
            (card.era(), card.granting_cell_ids())
        };

        let mut granted = 0;
        let mut suspended = false;
        for cell_id in cells {
            let call = self
                .transport
                .grant_shortcuts(cell_id, GrantShortcutsRequest { card_id, era });
            match with_timeout("grant_shortcuts", self.rpc_timeout, call).await {
                Ok(response) if response.suspended => {
                    suspended |= self.suspend_reported(cell_id);
                }
                Ok(_) => {
                    let mut card = entry.lock().await;
                    if card.era() == era && card.finish_grant(cell_id) {
                        granted += 1;
                        entry.publish(&card);
                    }
                }
                Err(err) => self.record_rpc_failure(card_id, cell_id, "grant", &err),
            }
        }

        if granted > 0 {
            log_event_with_fields(
                Event::ShortcutsGranted,
                &[
                    ("card_id", &card_id.to_string()),
                    ("era", &era.to_string()),
                    ("granted", &granted.to_string()),
                ],
            );
        }
        if suspended {
            self.manager.mark_all_cards_pending().await?;
        }
        Ok(granted)
    }

    /// Suspend a cell that answered a grant as suspended
    fn suspend_reported(&self, cell_id: CellId) -> bool {
        match self.coordinators.suspend(cell_id) {
            Ok(changed) => {
                if changed {
                    log_event_with_fields(
                        Event::CoordinatorSuspended,
                        &[("cell_id", &cell_id.to_string()), ("source", "grant_response")],
                    );
                }
                changed
            }
            Err(err) => {
                log_warning(
                    Event::CoordinatorSuspended,
                    &[("cell_id", &cell_id.to_string()), ("error", &err.to_string())],
                );
                false
            }
        }
    }

    fn record_rpc_failure(&self, card_id: CardId, cell_id: CellId, rpc: &str, err: &ChaosError) {
        self.manager.metrics().increment_shortcut_rpc_failures();
        log_warning(
            Event::ShortcutRpcFailed,
            &[
                ("card_id", &card_id.to_string()),
                ("cell_id", &cell_id.to_string()),
                ("rpc", rpc),
                ("error", &err.to_string()),
            ],
        );
    }

    /// Revoke the shortcuts of a removed card
    pub async fn release_card_shortcuts(&self, card: &ReplicationCard) {
        let card_id = card.card_id();
        join_all(card.coordinators().keys().map(|cell_id| async move {
            let call = self.transport.revoke_shortcuts(*cell_id, card_id);
            if let Err(err) = with_timeout("revoke_shortcuts", self.rpc_timeout, call).await {
                self.record_rpc_failure(card_id, *cell_id, "revoke", &err);
            }
        }))
        .await;
    }

    // =========================================================================
    // COORDINATOR CHANGES
    // =========================================================================

    /// Suspend a coordinator; every card moves to a new era without it
    pub async fn suspend_coordinator(&self, cell_id: CellId) -> ChaosResult<bool> {
        let changed = self.coordinators.suspend(cell_id)?;
        if changed {
            log_event_with_fields(
                Event::CoordinatorSuspended,
                &[("cell_id", &cell_id.to_string()), ("source", "request")],
            );
            self.manager.mark_all_cards_pending().await?;
        }
        Ok(changed)
    }

    /// Resume a coordinator; every card moves to a new era including it
    pub async fn resume_coordinator(&self, cell_id: CellId) -> ChaosResult<bool> {
        let changed = self.coordinators.resume(cell_id)?;
        if changed {
            log_event_with_fields(
                Event::CoordinatorResumed,
                &[("cell_id", &cell_id.to_string())],
            );
            self.manager.mark_all_cards_pending().await?;
        }
        Ok(changed)
    }

    /// Change the coordinator cell list
    pub async fn update_coordinator_cells(
        &self,
        add: &[CoordinatorCell],
        remove: &[CellId],
    ) -> ChaosResult<Vec<CellId>> {
        let expected = self.manager.clock().clock_tag();
        if let Some(cell) = add.iter().find(|cell| !cell.is_compatible_with(expected)) {
            log_warning(
                Event::CoordinatorCellsUpdated,
                &[
                    ("cell_id", &cell.cell_id.to_string()),
                    ("error", "clock mismatch"),
                ],
            );
            return Err(ChaosError::ClockMismatch {
                expected,
                actual: cell.clock_tag,
            });
        }
        let added = self.coordinators.update_cells(add, remove)?;
        if !added.is_empty() || !remove.is_empty() {
            log_event_with_fields(
                Event::CoordinatorCellsUpdated,
                &[
                    ("added", &added.len().to_string()),
                    ("removed", &remove.len().to_string()),
                ],
            );
            self.manager.mark_all_cards_pending().await?;
        }
        Ok(added)
    }

    // =========================================================================
    // BACKGROUND LOOP
    // =========================================================================

    /// Retry every card that is pending or still granting shortcuts
    pub async fn investigate_stalled_cards(&self) -> ChaosResult<usize> {
        let mut advanced = 0;
        for card_id in self.manager.card_ids()? {
            let stalled = match self.manager.card_entry(card_id) {
                Ok(entry) => {
                    let card = entry.lock().await;
                    card.needs_new_era() || !card.granting_cell_ids().is_empty()
                }
                Err(ChaosError::NoSuchCard(_)) => continue,
                Err(err) => return Err(err),
            };
            if !stalled {
                continue;
            }
            match self.advance_card(card_id).await {
                Ok(Some(_)) => advanced += 1,
                Ok(None) | Err(ChaosError::NoSuchCard(_)) => {}
                Err(err) => log_warning(
                    Event::EraCommenceDeferred,
                    &[("card_id", &card_id.to_string()), ("error", &err.to_string())],
                ),
            }
        }
        Ok(advanced)
    }

    /// Advance cards as they become pending until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut pending: mpsc::UnboundedReceiver<CardId>,
        mut shutdown: watch::Receiver<bool>,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                card_id = pending.recv() => {
                    let Some(card_id) = card_id else { break };
                    match self.advance_card(card_id).await {
                        Ok(_) | Err(ChaosError::NoSuchCard(_)) => {}
                        Err(err) => log_warning(
                            Event::EraCommenceDeferred,
                            &[("card_id", &card_id.to_string()), ("error", &err.to_string())],
                        ),
                    }
                }
                _ = interval.tick() => {
                    if let Err(err) = self.investigate_stalled_cards().await {
                        log_warning(Event::EraCommenceDeferred, &[("error", &err.to_string())]);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::coordinator::LocalCoordinatorTransport;
    use crate::manager::{CreateCardRequest, CreateReplicaRequest, ManagerOptions};
    use crate::observability::MetricsRegistry;
    use crate::replica::{ContentType, ReplicaAttributes, ReplicaMode, ReplicaState};
    use crate::types::Timestamp;

    struct Fixture {
        manager: Arc<ChaosManager>,
        transport: Arc<LocalCoordinatorTransport>,
        engine: EraEngine,
        cells: Vec<CellId>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(None, Timestamp::from_parts(1_000, 0)));
        let manager = Arc::new(ChaosManager::new(
            clock,
            Arc::new(MetricsRegistry::new()),
            ManagerOptions::default(),
        ));
        let coordinators = Arc::new(CoordinatorManager::new());
        let cells = vec![CellId::generate(), CellId::generate()];
        let add: Vec<CoordinatorCell> = cells.iter().map(|c| CoordinatorCell::new(*c, None)).collect();
        coordinators.update_cells(&add, &[]).unwrap();
        let transport = Arc::new(LocalCoordinatorTransport::new());
        let engine = EraEngine::new(
            Arc::clone(&manager),
            coordinators,
            Arc::clone(&transport) as Arc<dyn CoordinatorTransport>,
            Duration::from_secs(1),
        );
        Fixture {
            manager,
            transport,
            engine,
            cells,
        }
    }

    async fn card_with_sync_queue(manager: &ChaosManager) -> CardId {
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(ReplicaAttributes::new(
                    "primary",
                    "//q",
                    ContentType::Queue,
                    ReplicaMode::Sync,
                    true,
                )),
            )
            .await
            .unwrap();
        card_id
    }

    #[tokio::test]
    async fn test_deferred_without_sync_queue() {
        let f = fixture();
        let card_id = f.manager.create_card(CreateCardRequest::default()).unwrap();
        assert_eq!(f.engine.advance_card(card_id).await.unwrap(), None);
        assert_eq!(f.manager.get_card(card_id).await.unwrap().era, 0);
    }

    #[tokio::test]
    async fn test_commence_and_grant() {
        let f = fixture();
        let card_id = card_with_sync_queue(&f.manager).await;

        assert_eq!(f.engine.advance_card(card_id).await.unwrap(), Some(1));
        let card = f.manager.get_card(card_id).await.unwrap();
        assert_eq!(card.era, 1);
        assert_eq!(card.coordinator_cell_ids.len(), 2);
        assert!(card.replicas.values().all(|r| r.state() == ReplicaState::Enabled));
        for cell_id in &f.cells {
            assert_eq!(f.transport.shortcuts_of(*cell_id).get(&card_id), Some(&1));
        }

        // Nothing pending: no new era
        assert_eq!(f.engine.advance_card(card_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_blocks_commence() {
        let f = fixture();
        let card_id = card_with_sync_queue(&f.manager).await;
        f.engine.advance_card(card_id).await.unwrap();

        f.transport.set_unreachable(f.cells[0], true);
        f.manager.mark_all_cards_pending().await.unwrap();
        assert_eq!(f.engine.advance_card(card_id).await.unwrap(), None);
        assert_eq!(f.manager.get_card(card_id).await.unwrap().era, 1);

        // Once the cell is suspended its shortcut is dropped without the RPC
        f.engine.suspend_coordinator(f.cells[0]).await.unwrap();
        assert_eq!(f.engine.advance_card(card_id).await.unwrap(), Some(2));
        let card = f.manager.get_card(card_id).await.unwrap();
        assert_eq!(card.coordinator_cell_ids, vec![f.cells[1]]);
    }

    #[tokio::test]
    async fn test_suspended_grant_response() {
        let f = fixture();
        let card_id = card_with_sync_queue(&f.manager).await;
        f.transport.set_suspended(f.cells[0], true);

        f.engine.advance_card(card_id).await.unwrap();
        assert!(f.engine.coordinators().is_suspended(f.cells[0]));

        // The suspension makes the card pending again
        assert_eq!(f.engine.investigate_stalled_cards().await.unwrap(), 1);
        let card = f.manager.get_card(card_id).await.unwrap();
        assert_eq!(card.era, 2);
        assert_eq!(card.coordinator_cell_ids, vec![f.cells[1]]);
    }

    #[tokio::test]
    async fn test_resume_restores_coordinator() {
        let f = fixture();
        let card_id = card_with_sync_queue(&f.manager).await;
        f.engine.advance_card(card_id).await.unwrap();

        f.engine.suspend_coordinator(f.cells[1]).await.unwrap();
        f.engine.advance_card(card_id).await.unwrap();
        assert_eq!(f.manager.get_card(card_id).await.unwrap().coordinator_cell_ids.len(), 1);

        f.engine.resume_coordinator(f.cells[1]).await.unwrap();
        assert_eq!(f.engine.advance_card(card_id).await.unwrap(), Some(3));
        assert_eq!(f.manager.get_card(card_id).await.unwrap().coordinator_cell_ids.len(), 2);
    }
}
