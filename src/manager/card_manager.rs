//! Card manager
//!
//! Management operations on replication cards. Each operation runs under
//! the card lock against a draft copy of the card, and the draft only
//! replaces the card once the whole operation succeeded. Operations that
//! leave the card needing a new era notify the era engine.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::registry::{CardEntry, CardRegistry, EraStatus};
use super::table_nodes::{TableNode, TableNodeRegistry};
use crate::card::{CardOptions, CardSnapshot, ReplicationCard};
use crate::clock::TimestampProvider;
use crate::errors::{ChaosError, ChaosResult};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};
use crate::progress::ReplicationProgress;
use crate::replica::{AlterReplicaRequest, ReplicaAttributes, TableReplica};
use crate::types::{CardId, ClockTag, Era, Key, ReplicaId, TableId, Timestamp, INITIAL_ERA};

/// Default limit of replicas per card
pub const DEFAULT_MAX_REPLICAS_PER_CARD: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    pub max_replicas_per_card: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_replicas_per_card: DEFAULT_MAX_REPLICAS_PER_CARD,
        }
    }
}

/// Parameters of `create_card`
#[derive(Debug, Clone, Default)]
pub struct CreateCardRequest {
    /// Id to use instead of a generated one
    pub card_id: Option<CardId>,
    pub table_id: Option<TableId>,
    /// Logical table owning the card
    pub table_path: Option<String>,
    pub table_cluster_name: Option<String>,
    pub clock_tag: Option<ClockTag>,
    pub options: CardOptions,
}

/// Parameters of `create_replica`
#[derive(Debug, Clone)]
pub struct CreateReplicaRequest {
    pub attributes: ReplicaAttributes,
    /// Start from the minimum timestamp and pull the whole backlog
    pub catchup: bool,
    /// Resume from a known position, e.g. when copying a table
    pub replication_progress: Option<ReplicationProgress>,
    /// Card era the request was built against
    pub expected_era: Option<Era>,
}

impl CreateReplicaRequest {
    pub fn new(attributes: ReplicaAttributes) -> Self {
        Self {
            attributes,
            catchup: true,
            replication_progress: None,
            expected_era: None,
        }
    }

    pub fn without_catchup(mut self) -> Self {
        self.catchup = false;
        self
    }

    pub fn with_progress(mut self, progress: ReplicationProgress) -> Self {
        self.replication_progress = Some(progress);
        self
    }

    pub fn with_expected_era(mut self, era: Era) -> Self {
        self.expected_era = Some(era);
        self
    }
}

/// Card manager of a chaos cell
pub struct ChaosManager {
    registry: CardRegistry,
    table_nodes: TableNodeRegistry,
    clock: Arc<dyn TimestampProvider>,
    metrics: Arc<MetricsRegistry>,
    options: ManagerOptions,
    pending_tx: mpsc::UnboundedSender<CardId>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<CardId>>>,
}

impl ChaosManager {
    pub fn new(
        clock: Arc<dyn TimestampProvider>,
        metrics: Arc<MetricsRegistry>,
        options: ManagerOptions,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            registry: CardRegistry::new(),
            table_nodes: TableNodeRegistry::new(),
            clock,
            metrics,
            options,
            pending_tx,
            pending_rx: Mutex::new(Some(pending_rx)),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn clock(&self) -> &Arc<dyn TimestampProvider> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn table_nodes(&self) -> &TableNodeRegistry {
        &self.table_nodes
    }

    /// Receiver of cards needing a new era; can be taken once
    pub fn take_pending_receiver(&self) -> Option<mpsc::UnboundedReceiver<CardId>> {
        self.pending_rx.lock().ok()?.take()
    }

    pub fn card_entry(&self, card_id: CardId) -> ChaosResult<Arc<CardEntry>> {
        self.registry.get(card_id)
    }

    pub fn card_ids(&self) -> ChaosResult<Vec<CardId>> {
        self.registry.card_ids()
    }

    pub fn card_count(&self) -> usize {
        self.registry.len()
    }

    fn notify_pending(&self, card_id: CardId) {
        // A closed channel means the engine is gone; the card stays pending.
        let _ = self.pending_tx.send(card_id);
    }

    /// Apply `change` to a draft of the card and commit it on success
    async fn mutate<T, F>(&self, card_id: CardId, change: F) -> ChaosResult<T>
    where
        F: FnOnce(&mut ReplicationCard) -> ChaosResult<T>,
    {
        let (result, _) = self.mutate_at(card_id, None, change).await?;
        Ok(result)
    }

    /// Like `mutate`, but fails if the card moved past `expected_era`
    ///
    /// Returns the card era the change was applied at.
    async fn mutate_at<T, F>(
        &self,
        card_id: CardId,
        expected_era: Option<Era>,
        change: F,
    ) -> ChaosResult<(T, Era)>
    where
        F: FnOnce(&mut ReplicationCard) -> ChaosResult<T>,
    {
        let entry = self.registry.get(card_id)?;
        let mut card = entry.lock().await;
        if let Some(expected) = expected_era {
            if card.era() != expected {
                return Err(ChaosError::EraMismatch {
                    card_id,
                    expected,
                    actual: card.era(),
                });
            }
        }
        let mut draft = card.clone();
        let result = change(&mut draft)?;
        *card = draft;
        entry.publish(&card);
        if card.needs_new_era() {
            self.notify_pending(card_id);
        }
        Ok((result, card.era()))
    }

    // =========================================================================
    // CARDS
    // =========================================================================

    /// Create an empty card at the initial era
    pub fn create_card(&self, request: CreateCardRequest) -> ChaosResult<CardId> {
        let card_id = request.card_id.unwrap_or_else(CardId::generate);
        let mut card = ReplicationCard::new(card_id, request.clock_tag, request.options).with_table(
            request.table_id,
            request.table_path.clone(),
            request.table_cluster_name,
        );
        // Coordinators receive shortcuts with the first commenced era
        card.mark_coordinator_change();
        self.registry.insert(card)?;

        if let Some(path) = request.table_path {
            if let Err(err) = self.table_nodes.register(TableNode {
                path,
                card_id,
                owns_card: true,
            }) {
                let _ = self.registry.remove(card_id);
                return Err(err);
            }
        }

        self.metrics.increment_cards_created();
        log_event_with_fields(Event::CardCreated, &[("card_id", &card_id.to_string())]);
        self.notify_pending(card_id);
        Ok(card_id)
    }

    /// Remove a card with all its replicas
    pub async fn remove_card(&self, card_id: CardId) -> ChaosResult<ReplicationCard> {
        let entry = self.registry.remove(card_id)?;
        // Wait for operations still holding the card
        let card = entry.lock().await.clone();

        self.metrics.increment_cards_removed();
        log_event_with_fields(
            Event::CardRemoved,
            &[
                ("card_id", &card_id.to_string()),
                ("replica_count", &card.replicas().len().to_string()),
            ],
        );
        Ok(card)
    }

    /// Consistent view of a card at its current era
    pub async fn get_card(&self, card_id: CardId) -> ChaosResult<CardSnapshot> {
        let entry = self.registry.get(card_id)?;
        let card = entry.lock().await;
        Ok(card.snapshot())
    }

    pub fn era_status(&self, card_id: CardId) -> ChaosResult<EraStatus> {
        Ok(self.registry.get(card_id)?.status())
    }

    /// Attach a logical table (a view or copy) that does not own the card
    pub fn attach_table(&self, path: impl Into<String>, card_id: CardId) -> ChaosResult<()> {
        if !self.registry.contains(card_id) {
            return Err(ChaosError::NoSuchCard(card_id));
        }
        self.table_nodes.register(TableNode {
            path: path.into(),
            card_id,
            owns_card: false,
        })
    }

    /// Remove a logical table; the card goes with it only if it was owned
    pub async fn remove_table(&self, path: &str) -> ChaosResult<Option<ReplicationCard>> {
        match self.table_nodes.remove(path)? {
            Some(card_id) => Ok(Some(self.remove_card(card_id).await?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // REPLICAS
    // =========================================================================

    /// Add a replica to a card
    ///
    /// The replica progress is the requested progress intersected with
    /// what enabled replicas have already replicated, so rows in flight
    /// are pulled rather than missed.
    pub async fn create_replica(
        &self,
        card_id: CardId,
        request: CreateReplicaRequest,
    ) -> ChaosResult<ReplicaId> {
        let (replica_id, _) = self.create_replica_with_era(card_id, request).await?;
        Ok(replica_id)
    }

    /// `create_replica` returning the card era it was applied at
    pub async fn create_replica_with_era(
        &self,
        card_id: CardId,
        request: CreateReplicaRequest,
    ) -> ChaosResult<(ReplicaId, Era)> {
        if !request.catchup && request.replication_progress.is_some() {
            return Err(ChaosError::invalid_request(
                "Replication progress specified while replica is not to be catched up",
            ));
        }
        let limit = self.options.max_replicas_per_card;
        let clock = Arc::clone(&self.clock);

        let (replica_id, era) = self
            .mutate_at(card_id, request.expected_era, move |card| {
                let attributes = request.attributes;
                if card
                    .find_replica_by_path(&attributes.cluster_name, &attributes.replica_path)
                    .is_some()
                {
                    return Err(ChaosError::ReplicaAlreadyExists {
                        cluster: attributes.cluster_name,
                        path: attributes.replica_path,
                    });
                }
                if card.replicas().len() >= limit {
                    return Err(ChaosError::TooManyReplicas { card_id, limit });
                }

                let now = clock.generate_timestamp();
                let explicit = request.replication_progress.is_some();
                let requested = match request.replication_progress {
                    Some(progress) => {
                        progress.validate()?;
                        progress
                    }
                    None if request.catchup => ReplicationProgress::uniform(Timestamp::MIN),
                    None => ReplicationProgress::uniform(now),
                };
                let progress = match card.known_progress() {
                    Some(known) => requested.intersect(&known),
                    None => requested,
                };

                if (request.catchup || explicit)
                    && card.era() != INITIAL_ERA
                    && !card.has_waiting_replica(&progress)
                {
                    return Err(ChaosError::BacklogUnavailable(card_id));
                }

                let replica_id = card.generate_replica_id();
                let replica =
                    TableReplica::create(replica_id, attributes, card.era(), progress, now)?;
                card.insert_replica(replica);
                card.mark_coordinator_change();
                Ok(replica_id)
            })
            .await?;

        self.metrics.increment_replicas_created();
        log_event_with_fields(
            Event::ReplicaCreated,
            &[
                ("card_id", &card_id.to_string()),
                ("replica_id", &replica_id.to_string()),
                ("era", &era.to_string()),
            ],
        );
        Ok((replica_id, era))
    }

    /// Remove a disabled replica
    pub async fn remove_replica(&self, replica_id: ReplicaId) -> ChaosResult<()> {
        self.remove_replica_with_era(replica_id, None).await?;
        Ok(())
    }

    /// `remove_replica` guarded by the card era; returns the era it was
    /// applied at
    pub async fn remove_replica_with_era(
        &self,
        replica_id: ReplicaId,
        expected_era: Option<Era>,
    ) -> ChaosResult<Era> {
        let ((), era) = self
            .mutate_at(replica_id.card_id, expected_era, |card| {
                card.remove_replica(replica_id)?;
                card.mark_coordinator_change();
                Ok(())
            })
            .await?;

        self.metrics.increment_replicas_removed();
        log_event_with_fields(
            Event::ReplicaRemoved,
            &[
                ("replica_id", &replica_id.to_string()),
                ("era", &era.to_string()),
            ],
        );
        Ok(era)
    }

    /// Request a mode and/or state change
    ///
    /// Returns whether the replica changed; the change takes effect with
    /// the next era.
    pub async fn alter_replica(
        &self,
        replica_id: ReplicaId,
        request: AlterReplicaRequest,
    ) -> ChaosResult<bool> {
        let (changed, _) = self.alter_replica_with_era(replica_id, request).await?;
        Ok(changed)
    }

    /// `alter_replica` returning the card era it was applied at
    pub async fn alter_replica_with_era(
        &self,
        replica_id: ReplicaId,
        request: AlterReplicaRequest,
    ) -> ChaosResult<(bool, Era)> {
        let (changed, era) = self
            .mutate_at(replica_id.card_id, request.expected_era, |card| {
                card.replica_mut(replica_id)?.alter(&request)
            })
            .await?;

        if changed {
            self.metrics.increment_replicas_altered();
            log_event_with_fields(
                Event::ReplicaAltered,
                &[
                    ("replica_id", &replica_id.to_string()),
                    ("mode", request.mode.map_or("-", |m| m.as_str())),
                    (
                        "enabled",
                        &request.enabled.map_or("-".to_string(), |e| e.to_string()),
                    ),
                    ("era", &era.to_string()),
                ],
            );
        }
        Ok((changed, era))
    }

    /// Merge progress reported by a replica
    pub async fn update_replica_progress(
        &self,
        replica_id: ReplicaId,
        progress: &ReplicationProgress,
    ) -> ChaosResult<()> {
        progress.validate()?;
        let min_timestamp = self
            .mutate(replica_id.card_id, |card| {
                let replica = card.replica_mut(replica_id)?;
                replica.update_progress(progress)?;
                Ok(replica.replication_progress().min_timestamp())
            })
            .await?;

        log_event_with_fields(
            Event::ProgressUpdated,
            &[
                ("replica_id", &replica_id.to_string()),
                ("min_timestamp", &min_timestamp.to_string()),
            ],
        );
        Ok(())
    }

    /// Follow a repartitioning of the replica table
    pub async fn reshard_replica(
        &self,
        replica_id: ReplicaId,
        pivots: &[Key],
        tablet_count: u32,
    ) -> ChaosResult<()> {
        self.mutate(replica_id.card_id, |card| {
            let replica = card.replica_mut(replica_id)?;
            replica.set_tablet_count(tablet_count)?;
            replica.reshape_progress(pivots);
            Ok(())
        })
        .await?;

        log_event_with_fields(
            Event::ReplicaResharded,
            &[
                ("replica_id", &replica_id.to_string()),
                ("tablet_count", &tablet_count.to_string()),
            ],
        );
        Ok(())
    }

    // =========================================================================
    // ERAS
    // =========================================================================

    /// Record that a tablet has observed `era`
    ///
    /// Returns the era status after the acknowledgement.
    pub async fn acknowledge_era(
        &self,
        replica_id: ReplicaId,
        tablet_index: u32,
        era: Era,
    ) -> ChaosResult<EraStatus> {
        let card_id = replica_id.card_id;
        let (before, after) = self
            .mutate(card_id, |card| {
                if era > card.era() {
                    return Err(ChaosError::invalid_request(format!(
                        "era {} is ahead of card {} era {}",
                        era,
                        card_id,
                        card.era()
                    )));
                }
                let before = card.settled_era();
                card.replica_mut(replica_id)?.acknowledge_era(tablet_index, era)?;
                Ok((before, EraStatus {
                    era: card.era(),
                    settled_era: card.settled_era(),
                }))
            })
            .await?;

        Logger::trace(
            Event::EraAcknowledged.as_str(),
            &[
                ("replica_id", &replica_id.to_string()),
                ("tablet_index", &tablet_index.to_string()),
                ("era", &era.to_string()),
            ],
        );
        if after.settled_era != before && after.is_settled_at(after.era) {
            log_event_with_fields(
                Event::EraSettled,
                &[("card_id", &card_id.to_string()), ("era", &after.era.to_string())],
            );
        }
        Ok(after)
    }

    /// Mark every card as needing a new era after a coordinator change
    pub async fn mark_all_cards_pending(&self) -> ChaosResult<()> {
        for card_id in self.registry.card_ids()? {
            match self
                .mutate(card_id, |card| {
                    card.mark_coordinator_change();
                    Ok(())
                })
                .await
            {
                Ok(()) | Err(ChaosError::NoSuchCard(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    // =========================================================================
    // HISTORY AND LAG
    // =========================================================================

    /// Drop history items preceding the one in force at `retain_timestamp`
    pub async fn remove_expired_replica_history(
        &self,
        replica_id: ReplicaId,
        retain_timestamp: Timestamp,
    ) -> ChaosResult<usize> {
        let removed = self
            .mutate(replica_id.card_id, |card| {
                Ok(card.replica_mut(replica_id)?.remove_history_before(retain_timestamp))
            })
            .await?;
        if removed > 0 {
            log_event_with_fields(
                Event::HistoryExpired,
                &[
                    ("replica_id", &replica_id.to_string()),
                    ("removed", &removed.to_string()),
                ],
            );
        }
        Ok(removed)
    }

    /// Expire history items that the progress of every replica has passed
    ///
    /// Items are only dropped once they are older than `retention_ms`.
    pub async fn expire_card_history(&self, card_id: CardId, retention_ms: u64) -> ChaosResult<usize> {
        let latest = self.clock.latest_timestamp();
        self.mutate(card_id, |card| {
            let Some(passed) = card
                .replicas()
                .values()
                .map(|r| r.replication_progress().min_timestamp())
                .min()
            else {
                return Ok(0);
            };
            let retain = passed.min(Timestamp::from_parts(
                latest.physical_ms().saturating_sub(retention_ms),
                0,
            ));
            Ok(card
                .replicas_mut()
                .map(|replica| replica.remove_history_before(retain))
                .sum())
        })
        .await
    }

    /// Lag of each replica behind the latest timestamp, in milliseconds
    pub async fn replica_lag_times(&self, card_id: CardId) -> ChaosResult<Vec<(ReplicaId, u64)>> {
        let entry = self.registry.get(card_id)?;
        let card = entry.lock().await;
        Ok(card.replica_lag_times(self.clock.latest_timestamp()))
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Copies of every card, for snapshots
    pub async fn export_cards(&self) -> ChaosResult<Vec<ReplicationCard>> {
        let mut cards = Vec::new();
        for card_id in self.registry.card_ids()? {
            match self.registry.get(card_id) {
                Ok(entry) => cards.push(entry.lock().await.clone()),
                Err(ChaosError::NoSuchCard(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(cards)
    }

    /// Register a card restored from a snapshot
    pub fn import_card(&self, card: ReplicationCard) -> ChaosResult<()> {
        let card_id = card.card_id();
        let pending = card.needs_new_era();
        self.registry.insert(card)?;
        if pending {
            self.notify_pending(card_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::ErrorCategory;
    use crate::replica::{ContentType, ReplicaMode, ReplicaState};

    fn manager() -> ChaosManager {
        let clock = Arc::new(ManualClock::new(None, Timestamp::from_parts(1_000, 0)));
        ChaosManager::new(
            clock,
            Arc::new(MetricsRegistry::new()),
            ManagerOptions {
                max_replicas_per_card: 2,
            },
        )
    }

    fn attributes(path: &str, content_type: ContentType, mode: ReplicaMode) -> ReplicaAttributes {
        ReplicaAttributes::new("primary", path, content_type, mode, true)
    }

    #[tokio::test]
    async fn test_create_card_with_hint() {
        let manager = manager();
        let hint = CardId::generate();
        let card_id = manager
            .create_card(CreateCardRequest {
                card_id: Some(hint),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(card_id, hint);

        let snapshot = manager.get_card(card_id).await.unwrap();
        assert_eq!(snapshot.era, INITIAL_ERA);
        assert!(snapshot.replicas.is_empty());
        assert!(manager
            .create_card(CreateCardRequest {
                card_id: Some(hint),
                ..Default::default()
            })
            .is_err());
    }

    #[tokio::test]
    async fn test_pending_notifications() {
        let manager = manager();
        let mut pending = manager.take_pending_receiver().unwrap();
        assert!(manager.take_pending_receiver().is_none());

        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        assert_eq!(pending.recv().await, Some(card_id));
    }

    #[tokio::test]
    async fn test_replica_uniqueness_and_limit() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        let request =
            CreateReplicaRequest::new(attributes("//q", ContentType::Queue, ReplicaMode::Sync));

        manager.create_replica(card_id, request.clone()).await.unwrap();
        let err = manager.create_replica(card_id, request).await.unwrap_err();
        assert!(matches!(err, ChaosError::ReplicaAlreadyExists { .. }));

        manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(attributes("//d", ContentType::Data, ReplicaMode::Async)),
            )
            .await
            .unwrap();
        let err = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(attributes("//e", ContentType::Data, ReplicaMode::Async)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::TooManyReplicas { limit: 2, .. }));
    }

    #[tokio::test]
    async fn test_progress_seeding() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();

        let catchup = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(attributes("//q", ContentType::Queue, ReplicaMode::Sync)),
            )
            .await
            .unwrap();
        let fresh = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(attributes("//d", ContentType::Data, ReplicaMode::Async))
                    .without_catchup(),
            )
            .await
            .unwrap();

        let card = manager.get_card(card_id).await.unwrap();
        let catchup = card.replica(catchup).unwrap();
        let fresh = card.replica(fresh).unwrap();
        assert_eq!(catchup.replication_progress().min_timestamp(), Timestamp::MIN);
        // No enabled replica to intersect with, so it starts at "now"
        assert!(fresh.replication_progress().min_timestamp() > Timestamp::MIN);
        assert_eq!(fresh.state(), ReplicaState::Enabling);
    }

    #[tokio::test]
    async fn test_remove_requires_disabled() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        let replica_id = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(attributes("//q", ContentType::Queue, ReplicaMode::Sync)),
            )
            .await
            .unwrap();

        let err = manager.remove_replica(replica_id).await.unwrap_err();
        assert!(matches!(err, ChaosError::ReplicaNotDisabled(_)));
        assert!(manager.get_card(card_id).await.unwrap().replica(replica_id).is_ok());
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_card_untouched() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        let replica_id = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(attributes("//d", ContentType::Data, ReplicaMode::Sync)),
            )
            .await
            .unwrap();
        let before = manager.get_card(card_id).await.unwrap();

        let err = manager
            .alter_replica(replica_id, AlterReplicaRequest::enabled(false))
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::StateTransitioning(_)));
        assert!(err.is_retryable());
        assert_eq!(manager.get_card(card_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_expected_era_guards_changes() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        let request =
            CreateReplicaRequest::new(attributes("//q", ContentType::Queue, ReplicaMode::Sync));

        let err = manager
            .create_replica(card_id, request.clone().with_expected_era(INITIAL_ERA + 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChaosError::EraMismatch {
                expected: 1,
                actual: INITIAL_ERA,
                ..
            }
        ));
        assert_eq!(err.category(), ErrorCategory::TopologyConflict);
        assert!(err.is_retryable());
        assert!(manager.get_card(card_id).await.unwrap().replicas.is_empty());

        let (replica_id, era) = manager
            .create_replica_with_era(card_id, request.with_expected_era(INITIAL_ERA))
            .await
            .unwrap();
        assert_eq!(era, INITIAL_ERA);

        let err = manager
            .alter_replica(
                replica_id,
                AlterReplicaRequest::mode(ReplicaMode::Async).with_expected_era(3),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::EraMismatch { expected: 3, .. }));
        let err = manager
            .remove_replica_with_era(replica_id, Some(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::EraMismatch { .. }));
        assert!(manager.get_card(card_id).await.unwrap().replica(replica_id).is_ok());
    }

    #[tokio::test]
    async fn test_progress_requires_catchup() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        let err = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(attributes("//d", ContentType::Data, ReplicaMode::Async))
                    .without_catchup()
                    .with_progress(ReplicationProgress::uniform(Timestamp(10))),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidRequest);
        assert!(err.to_string().contains("not to be catched up"));
        assert!(manager.get_card(card_id).await.unwrap().replicas.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_rejects_future_era() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        let replica_id = manager
            .create_replica(
                card_id,
                CreateReplicaRequest::new(attributes("//q", ContentType::Queue, ReplicaMode::Sync)),
            )
            .await
            .unwrap();

        assert!(manager.acknowledge_era(replica_id, 0, 5).await.is_err());
        let status = manager.acknowledge_era(replica_id, 0, 0).await.unwrap();
        assert!(status.is_settled_at(0));
    }

    #[tokio::test]
    async fn test_remove_table_respects_ownership() {
        let manager = manager();
        let card_id = manager
            .create_card(CreateCardRequest {
                table_path: Some("//t".into()),
                ..Default::default()
            })
            .unwrap();
        manager.attach_table("//view", card_id).unwrap();

        assert!(manager.remove_table("//view").await.unwrap().is_none());
        assert_eq!(manager.card_count(), 1);

        let removed = manager.remove_table("//t").await.unwrap().unwrap();
        assert_eq!(removed.card_id(), card_id);
        assert_eq!(manager.card_count(), 0);
    }
}
