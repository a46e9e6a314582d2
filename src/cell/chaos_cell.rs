//! Chaos cell
//!
//! Wires the card manager, era engine, coordinator set, storage directory
//! and client entry points into one cell, restores it from its snapshot
//! and runs its background loops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::CellConfig;
use crate::card::{CardSnapshot, ReplicationCard};
use crate::client::{ChaosClient, ReplicaConsistency, Transaction, WriteResult};
use crate::clock::TimestampProvider;
use crate::coordinator::{CoordinatorCell, CoordinatorManager, CoordinatorTransport};
use crate::era::{wait_for_era_settlement, EraEngine, TabletObserver};
use crate::errors::{ChaosError, ChaosResult};
use crate::manager::{ChaosManager, CreateCardRequest, CreateReplicaRequest, EraStatus};
use crate::observability::{
    log_event, log_event_with_fields, log_warning, set_mutation_logging, Event, MetricsRegistry,
    MetricsSnapshot, ObservationScope,
};
use crate::progress::ReplicationProgress;
use crate::pull::{self, PullRowsRequest, PullRowsResponse, ReplicaPuller};
use crate::replica::AlterReplicaRequest;
use crate::snapshot::{load_snapshot, save_snapshot, CellSnapshot, SnapshotManifest};
use crate::storage::{ClusterDirectory, Row, TableSchema};
use crate::timeout::with_timeout;
use crate::types::{CardId, CellId, Era, Key, ReplicaId, RowKey, Timestamp};

pub struct ChaosCell {
    config: CellConfig,
    manager: Arc<ChaosManager>,
    engine: Arc<EraEngine>,
    directory: Arc<ClusterDirectory>,
    client: ChaosClient,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    agents: Mutex<HashSet<ReplicaId>>,
}

impl ChaosCell {
    /// Fresh cell with no cards
    pub fn new(
        config: CellConfig,
        clock: Arc<dyn TimestampProvider>,
        transport: Arc<dyn CoordinatorTransport>,
        directory: Arc<ClusterDirectory>,
    ) -> ChaosResult<Self> {
        config.validate()?;
        let coordinators = Arc::new(CoordinatorManager::new());
        coordinators.update_cells(&config.coordinator_cells(), &[])?;
        Self::assemble(config, clock, transport, directory, coordinators)
    }

    /// Cell restored from the snapshot in its data directory, if any
    pub fn open(
        config: CellConfig,
        clock: Arc<dyn TimestampProvider>,
        transport: Arc<dyn CoordinatorTransport>,
        directory: Arc<ClusterDirectory>,
    ) -> ChaosResult<Self> {
        let Some((_, snapshot)) = load_snapshot(&config.data_dir)? else {
            return Self::new(config, clock, transport, directory);
        };
        if snapshot.cell_id != config.cell_id {
            return Err(ChaosError::SnapshotCorrupted(format!(
                "snapshot of cell {} found in data directory of cell {}",
                snapshot.cell_id, config.cell_id
            )));
        }
        config.validate()?;

        let coordinators = Arc::new(CoordinatorManager::from_state(snapshot.coordinators));
        let cell = Self::assemble(config, clock, transport, directory, coordinators)?;
        for card in snapshot.cards {
            cell.manager.import_card(card)?;
        }
        for node in snapshot.table_nodes {
            cell.manager.table_nodes().register(node)?;
        }
        Ok(cell)
    }

    fn assemble(
        config: CellConfig,
        clock: Arc<dyn TimestampProvider>,
        transport: Arc<dyn CoordinatorTransport>,
        directory: Arc<ClusterDirectory>,
        coordinators: Arc<CoordinatorManager>,
    ) -> ChaosResult<Self> {
        if let (Some(expected), actual) = (config.clock_tag, clock.clock_tag()) {
            if actual != Some(expected) {
                return Err(ChaosError::ClockMismatch {
                    expected: Some(expected),
                    actual,
                });
            }
        }
        set_mutation_logging(config.enable_mutation_logging);

        let manager = Arc::new(ChaosManager::new(
            clock,
            Arc::new(MetricsRegistry::new()),
            config.manager_options(),
        ));
        let engine = Arc::new(EraEngine::new(
            Arc::clone(&manager),
            coordinators,
            transport,
            config.rpc_timeout(),
        ));
        let client = ChaosClient::new(Arc::clone(&manager), Arc::clone(&directory), config.rpc_timeout());
        let (shutdown, _) = watch::channel(false);

        log_event_with_fields(
            Event::CellStarting,
            &[
                ("cell_id", &config.cell_id.to_string()),
                ("cluster_name", &config.cluster_name),
            ],
        );
        Ok(Self {
            config,
            manager,
            engine,
            directory,
            client,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            agents: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    pub fn cell_id(&self) -> CellId {
        self.config.cell_id
    }

    pub fn manager(&self) -> &Arc<ChaosManager> {
        &self.manager
    }

    pub fn engine(&self) -> &Arc<EraEngine> {
        &self.engine
    }

    pub fn directory(&self) -> &Arc<ClusterDirectory> {
        &self.directory
    }

    pub fn client(&self) -> &ChaosClient {
        &self.client
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.manager.metrics().snapshot()
    }

    // ===== CARDS =====

    pub fn create_card(&self, request: CreateCardRequest) -> ChaosResult<CardId> {
        self.manager.create_card(request)
    }

    /// Remove a card and release the shortcuts coordinators hold for it
    pub async fn remove_card(&self, card_id: CardId) -> ChaosResult<()> {
        let card = self.manager.remove_card(card_id).await?;
        self.engine.release_card_shortcuts(&card).await;
        Ok(())
    }

    pub async fn get_card(&self, card_id: CardId) -> ChaosResult<CardSnapshot> {
        self.manager.get_card(card_id).await
    }

    pub fn attach_table(&self, path: impl Into<String>, card_id: CardId) -> ChaosResult<()> {
        self.manager.attach_table(path, card_id)
    }

    /// Remove a logical table; returns whether its card was removed too
    pub async fn remove_table(&self, path: &str) -> ChaosResult<bool> {
        match self.manager.remove_table(path).await? {
            Some(card) => {
                self.engine.release_card_shortcuts(&card).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ===== REPLICAS =====

    pub async fn create_replica(
        &self,
        card_id: CardId,
        request: CreateReplicaRequest,
    ) -> ChaosResult<ReplicaId> {
        self.manager.create_replica(card_id, request).await
    }

    pub async fn create_replica_with_era(
        &self,
        card_id: CardId,
        request: CreateReplicaRequest,
    ) -> ChaosResult<(ReplicaId, Era)> {
        self.manager.create_replica_with_era(card_id, request).await
    }

    /// Remove a disabled replica; returns the card era
    pub async fn remove_replica(
        &self,
        replica_id: ReplicaId,
        expected_era: Option<Era>,
    ) -> ChaosResult<Era> {
        self.manager
            .remove_replica_with_era(replica_id, expected_era)
            .await
    }

    pub async fn alter_replica(
        &self,
        replica_id: ReplicaId,
        request: AlterReplicaRequest,
    ) -> ChaosResult<bool> {
        self.manager.alter_replica(replica_id, request).await
    }

    pub async fn alter_replica_with_era(
        &self,
        replica_id: ReplicaId,
        request: AlterReplicaRequest,
    ) -> ChaosResult<(bool, Era)> {
        self.manager.alter_replica_with_era(replica_id, request).await
    }

    pub async fn update_replica_progress(
        &self,
        replica_id: ReplicaId,
        progress: &ReplicationProgress,
    ) -> ChaosResult<()> {
        self.manager.update_replica_progress(replica_id, progress).await
    }

    /// Repartition the replica table and reshape its progress to match
    pub async fn reshard_replica(&self, replica_id: ReplicaId, pivots: Vec<Key>) -> ChaosResult<TableSchema> {
        let card = self.manager.get_card(replica_id.card_id).await?;
        let replica = card.replica(replica_id)?;
        let store = self.directory.store(replica.cluster_name())?;
        let schema = with_timeout(
            "reshard",
            self.config.rpc_timeout(),
            store.reshard(replica.replica_path(), pivots),
        )
        .await?;
        self.manager
            .reshard_replica(replica_id, &schema.split_pivots(), schema.tablet_count())
            .await?;
        Ok(schema)
    }

    pub async fn replica_lag_times(&self, card_id: CardId) -> ChaosResult<Vec<(ReplicaId, u64)>> {
        self.manager.replica_lag_times(card_id).await
    }

    pub async fn remove_expired_replica_history(
        &self,
        replica_id: ReplicaId,
        retain_timestamp: Timestamp,
    ) -> ChaosResult<usize> {
        self.manager
            .remove_expired_replica_history(replica_id, retain_timestamp)
            .await
    }

    // ===== ERAS AND COORDINATORS =====

    /// Wait until every replica of the card has acknowledged `era`
    pub async fn wait_for_era_settlement(&self, card_id: CardId, era: Era) -> ChaosResult<EraStatus> {
        wait_for_era_settlement(
            &self.manager,
            card_id,
            era,
            self.config.settlement_timeout(),
            self.config.settlement_backoff(),
        )
        .await
    }

    /// Commence a pending era right away instead of waiting for the loop
    pub async fn advance_card(&self, card_id: CardId) -> ChaosResult<Option<Era>> {
        self.engine.advance_card(card_id).await
    }

    pub async fn suspend_coordinator(&self, cell_id: CellId) -> ChaosResult<bool> {
        self.engine.suspend_coordinator(cell_id).await
    }

    pub async fn resume_coordinator(&self, cell_id: CellId) -> ChaosResult<bool> {
        self.engine.resume_coordinator(cell_id).await
    }

    pub async fn update_coordinator_cells(
        &self,
        add: &[CoordinatorCell],
        remove: &[CellId],
    ) -> ChaosResult<Vec<CellId>> {
        self.engine.update_coordinator_cells(add, remove).await
    }

    // ===== DATA PLANE =====

    /// Serve a pull from the queue replica at `path` on `cluster_name`
    pub async fn pull_rows(
        &self,
        cluster_name: &str,
        path: &str,
        request: &PullRowsRequest,
    ) -> ChaosResult<PullRowsResponse> {
        let store = self.directory.store(cluster_name)?;
        let response = with_timeout(
            "pull_rows",
            self.config.rpc_timeout(),
            pull::pull_rows(store.as_ref(), path, request),
        )
        .await?;
        self.manager.metrics().add_rows_pulled(response.rows.len() as u64);
        log_event_with_fields(
            Event::RowsPulled,
            &[
                ("path", path),
                ("upstream_replica_id", &request.upstream_replica_id.to_string()),
                ("rows", &response.rows.len().to_string()),
            ],
        );
        Ok(response)
    }

    pub async fn trim_rows(
        &self,
        replica_id: ReplicaId,
        tablet_index: u32,
        trimmed_row_count: u64,
    ) -> ChaosResult<u64> {
        let card = self.manager.get_card(replica_id.card_id).await?;
        let store = self.directory.store(card.replica(replica_id)?.cluster_name())?;
        pull::trim_rows(
            &self.manager,
            store.as_ref(),
            replica_id,
            tablet_index,
            trimmed_row_count,
            self.config.rpc_timeout(),
        )
        .await
    }

    pub async fn insert_rows(&self, card_id: CardId, rows: Vec<(RowKey, Value)>) -> ChaosResult<WriteResult> {
        self.client.insert_rows(card_id, rows).await
    }

    pub async fn delete_rows(&self, card_id: CardId, keys: Vec<RowKey>) -> ChaosResult<WriteResult> {
        self.client.delete_rows(card_id, keys).await
    }

    pub async fn commit(&self, card_id: CardId, tx: Transaction) -> ChaosResult<WriteResult> {
        self.client.commit(card_id, tx).await
    }

    pub async fn lookup_rows(
        &self,
        card_id: CardId,
        keys: &[RowKey],
        timestamp: Timestamp,
        consistency: ReplicaConsistency,
    ) -> ChaosResult<Vec<Option<Row>>> {
        self.client.lookup_rows(card_id, keys, timestamp, consistency).await
    }

    pub async fn select_rows(
        &self,
        card_id: CardId,
        timestamp: Timestamp,
        consistency: ReplicaConsistency,
    ) -> ChaosResult<Vec<Row>> {
        self.client.select_rows(card_id, timestamp, consistency).await
    }

    pub async fn get_in_sync_replicas(
        &self,
        card_id: CardId,
        keys: Option<&[RowKey]>,
        timestamp: Timestamp,
    ) -> ChaosResult<Vec<ReplicaId>> {
        self.client.get_in_sync_replicas(card_id, keys, timestamp).await
    }

    // ===== INTROSPECTION AND PERSISTENCE =====

    /// JSON view of cards, coordinators and suspended coordinators
    pub async fn describe(&self) -> ChaosResult<Value> {
        let state = self.engine.coordinators().state()?;
        let mut cards = Vec::new();
        for card_id in self.manager.card_ids()? {
            match self.manager.get_card(card_id).await {
                Ok(card) => cards.push(serde_json::to_value(&card)?),
                Err(ChaosError::NoSuchCard(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let suspended: Value = state
            .suspended
            .iter()
            .map(|(cell_id, since)| (cell_id.to_string(), json!(since.to_rfc3339())))
            .collect::<serde_json::Map<String, Value>>()
            .into();

        Ok(json!({
            "cell_id": self.config.cell_id,
            "cluster_name": self.config.cluster_name,
            "coordinator_cell_ids": state.cells.keys().collect::<Vec<_>>(),
            "suspended_coordinator_cells": suspended,
            "replication_cards": cards,
            "metrics": self.metrics(),
        }))
    }

    /// Persist the cell state to its data directory
    pub async fn save_snapshot(&self) -> ChaosResult<SnapshotManifest> {
        let cell_field = self.config.cell_id.to_string();
        let scope = ObservationScope::with_fields("snapshot_save", &[("cell_id", &cell_field)]);
        let snapshot = CellSnapshot {
            cell_id: self.config.cell_id,
            cards: self.manager.export_cards().await?,
            coordinators: self.engine.coordinators().state()?,
            table_nodes: self.manager.table_nodes().nodes(),
        };
        match save_snapshot(&self.config.data_dir, &snapshot) {
            Ok(manifest) => {
                self.manager.metrics().increment_snapshots_saved();
                scope.complete_with_fields(&[("checksum", &manifest.checksum)]);
                Ok(manifest)
            }
            Err(err) => {
                scope.fail(&err.to_string());
                Err(err)
            }
        }
    }

    pub async fn export_cards(&self) -> ChaosResult<Vec<ReplicationCard>> {
        self.manager.export_cards().await
    }

    // ===== BACKGROUND LOOPS =====

    /// Start the era engine and maintenance loops
    pub fn start(self: &Arc<Self>) -> ChaosResult<()> {
        let pending = self
            .manager
            .take_pending_receiver()
            .ok_or_else(|| ChaosError::Internal("cell already started".into()))?;

        let engine = tokio::spawn(Arc::clone(&self.engine).run(
            pending,
            self.shutdown.subscribe(),
            self.config.era_commencing_period(),
        ));
        let cell = Arc::clone(self);
        let maintenance = tokio::spawn(async move { cell.run_maintenance().await });
        self.track(engine)?;
        self.track(maintenance)?;

        log_event_with_fields(
            Event::CellServing,
            &[("cell_id", &self.config.cell_id.to_string())],
        );
        Ok(())
    }

    fn track(&self, handle: JoinHandle<()>) -> ChaosResult<()> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| ChaosError::Internal("cell task list lock poisoned".into()))?;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(())
    }

    /// Replicas whose puller and observer are running on this cell
    pub fn hosted_agent_count(&self) -> ChaosResult<usize> {
        Ok(self
            .agents
            .lock()
            .map_err(|_| ChaosError::Internal("replica agent lock poisoned".into()))?
            .len())
    }

    fn release_replica_agents(&self, replica_id: ReplicaId) {
        // Poisoned only if another holder panicked; the entry is then left behind.
        if let Ok(mut agents) = self.agents.lock() {
            agents.remove(&replica_id);
        }
    }

    /// Spawn the puller and tablet observer of a replica once
    pub fn spawn_replica_agents(self: &Arc<Self>, replica_id: ReplicaId) -> ChaosResult<bool> {
        let inserted = self
            .agents
            .lock()
            .map_err(|_| ChaosError::Internal("replica agent lock poisoned".into()))?
            .insert(replica_id);
        if !inserted {
            return Ok(false);
        }

        let observer = Arc::new(TabletObserver::new(Arc::clone(&self.manager), replica_id));
        let puller = Arc::new(ReplicaPuller::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.directory),
            replica_id,
            self.config.max_pull_rows,
            self.config.rpc_timeout(),
        ));
        let observe = tokio::spawn(observer.run(self.shutdown.subscribe(), self.config.pull_period()));
        let pull = tokio::spawn(puller.run(self.shutdown.subscribe(), self.config.pull_period()));
        // Both loops end once the replica or its card is gone
        let cell = Arc::downgrade(self);
        self.track(tokio::spawn(async move {
            let _ = tokio::join!(observe, pull);
            if let Some(cell) = cell.upgrade() {
                cell.release_replica_agents(replica_id);
            }
        }))?;
        Ok(true)
    }

    /// One maintenance pass: agents, history expiry and queue trimming
    pub async fn maintain(self: &Arc<Self>) -> ChaosResult<()> {
        let reachable = self.directory.cluster_names();
        for card_id in self.manager.card_ids()? {
            let card = match self.manager.get_card(card_id).await {
                Ok(card) => card,
                Err(ChaosError::NoSuchCard(_)) => continue,
                Err(err) => return Err(err),
            };

            for replica in card.replicas.values() {
                if self.config.host_replica_agents && reachable.iter().any(|c| c == replica.cluster_name()) {
                    self.spawn_replica_agents(replica.replica_id())?;
                }
            }

            self.manager
                .expire_card_history(card_id, self.config.replica_history_retention_ms)
                .await?;

            if !self.config.enable_auto_trim {
                continue;
            }
            for queue in card.replicas.values().filter(|r| r.is_queue()) {
                let trimmed = match self.directory.store(queue.cluster_name()) {
                    Ok(store) => {
                        pull::trim_replicated_rows(
                            &self.manager,
                            store.as_ref(),
                            queue.replica_id(),
                            self.config.rpc_timeout(),
                        )
                        .await
                    }
                    Err(err) => Err(err),
                };
                if let Err(err) = trimmed {
                    log_warning(
                        Event::TrimRejected,
                        &[
                            ("replica_id", &queue.replica_id().to_string()),
                            ("error", &err.to_string()),
                        ],
                    );
                }
            }
        }
        Ok(())
    }

    async fn run_maintenance(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if let Err(err) = self.maintain().await {
                log_warning(Event::HistoryExpired, &[("error", &err.to_string())]);
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.maintenance_period()) => {}
            }
        }
    }

    /// Stop background loops and write a final snapshot
    pub async fn shutdown(&self) -> ChaosResult<SnapshotManifest> {
        // Receivers may all be gone already; nothing left to stop then.
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map_err(|_| ChaosError::Internal("cell task list lock poisoned".into()))?
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                log_warning(Event::CellStopped, &[("reason", "task did not stop in time")]);
            }
        }

        let manifest = self.save_snapshot().await?;
        log_event(Event::CellStopped);
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::clock::ManualClock;
    use crate::coordinator::LocalCoordinatorTransport;
    use crate::replica::{ContentType, ReplicaAttributes, ReplicaMode};
    use crate::storage::{MemoryReplicaStore, ReplicaStore};

    async fn cell(dir: &TempDir, cell_id: CellId) -> (ChaosCell, Arc<MemoryReplicaStore>) {
        let config = CellConfig::new(cell_id, "primary", dir.path());
        let store = Arc::new(MemoryReplicaStore::new("primary"));
        let directory = Arc::new(ClusterDirectory::new());
        directory.register(store.clone()).unwrap();
        let cell = ChaosCell::open(
            config,
            Arc::new(ManualClock::new(None, Timestamp::from_parts(1_000, 0))),
            Arc::new(LocalCoordinatorTransport::new()),
            directory,
        )
        .unwrap();
        (cell, store)
    }

    #[tokio::test]
    async fn test_snapshot_restores_cards_and_coordinators() {
        let dir = TempDir::new().unwrap();
        let cell_id = CellId::generate();
        let (first, _) = cell(&dir, cell_id).await;

        let card_id = first
            .create_card(CreateCardRequest {
                table_path: Some("//t".into()),
                ..Default::default()
            })
            .unwrap();
        let replica_id = first
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
        assert_eq!(first.advance_card(card_id).await.unwrap(), Some(1));
        first.save_snapshot().await.unwrap();

        let (second, _) = cell(&dir, cell_id).await;
        let card = second.get_card(card_id).await.unwrap();
        assert_eq!(card.era, 1);
        assert!(card.replica(replica_id).is_ok());
        assert_eq!(card.coordinator_cell_ids, vec![cell_id]);
        assert!(second.manager().table_nodes().get("//t").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_of_other_cell_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (first, _) = cell(&dir, CellId::generate()).await;
        first.save_snapshot().await.unwrap();

        let config = CellConfig::new(CellId::generate(), "primary", dir.path());
        let result = ChaosCell::open(
            config,
            Arc::new(ManualClock::new(None, Timestamp::from_parts(1, 0))),
            Arc::new(LocalCoordinatorTransport::new()),
            Arc::new(ClusterDirectory::new()),
        );
        assert!(matches!(result, Err(ChaosError::SnapshotCorrupted(_))));
    }

    #[tokio::test]
    async fn test_describe() {
        let dir = TempDir::new().unwrap();
        let (cell, _) = cell(&dir, CellId::generate()).await;
        let card_id = cell.create_card(CreateCardRequest::default()).unwrap();

        let view = cell.describe().await.unwrap();
        assert_eq!(view["replication_cards"].as_array().unwrap().len(), 1);
        assert_eq!(view["replication_cards"][0]["card_id"], json!(card_id));
        assert_eq!(view["coordinator_cell_ids"][0], json!(cell.cell_id()));
        assert_eq!(view["metrics"]["cards_created"], json!(1));
    }

    #[tokio::test]
    async fn test_reshard_reshapes_progress() {
        let dir = TempDir::new().unwrap();
        let (cell, store) = cell(&dir, CellId::generate()).await;
        store
            .create_table("//d", TableSchema::sorted(ContentType::Data, vec![]).unwrap())
            .await
            .unwrap();
        let card_id = cell.create_card(CreateCardRequest::default()).unwrap();
        let replica_id = cell
            .create_replica(
                card_id,
                CreateReplicaRequest::new(ReplicaAttributes::new(
                    "primary",
                    "//d",
                    ContentType::Data,
                    ReplicaMode::Async,
                    true,
                )),
            )
            .await
            .unwrap();

        let schema = cell
            .reshard_replica(replica_id, vec![Key::row(RowKey::int(10))])
            .await
            .unwrap();
        assert_eq!(schema.tablet_count(), 2);

        let card = cell.get_card(card_id).await.unwrap();
        let replica = card.replica(replica_id).unwrap();
        assert_eq!(replica.tablet_count(), 2);
        assert_eq!(replica.replication_progress().segments().len(), 2);
    }

    #[tokio::test]
    async fn test_agents_are_released_with_their_replica() {
        let dir = TempDir::new().unwrap();
        let (cell, _) = cell(&dir, CellId::generate()).await;
        let cell = Arc::new(cell);
        let card_id = cell.create_card(CreateCardRequest::default()).unwrap();
        let replica_id = cell
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

        assert!(cell.spawn_replica_agents(replica_id).unwrap());
        assert!(!cell.spawn_replica_agents(replica_id).unwrap());
        assert_eq!(cell.hosted_agent_count().unwrap(), 1);

        cell.remove_card(card_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while cell.hosted_agent_count().unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Released replicas can be hosted again
        assert!(cell.spawn_replica_agents(replica_id).unwrap());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let (cell, _) = cell(&dir, CellId::generate()).await;
        let cell = Arc::new(cell);
        cell.start().unwrap();
        assert!(cell.start().is_err());

        let manifest = cell.shutdown().await.unwrap();
        assert_eq!(manifest.card_count, 0);
    }
}
