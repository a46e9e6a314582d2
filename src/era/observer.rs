//! Tablet observers
//!
//! Stand-in for the node hosting the tablets of one replica: it watches
//! the card and acknowledges every new era for each tablet. A banned
//! observer stops acknowledging, which keeps only its own replica from
//! settling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::errors::{ChaosError, ChaosResult};
use crate::manager::ChaosManager;
use crate::observability::{log_warning, Event};
use crate::types::{Era, ReplicaId};

pub struct TabletObserver {
    manager: Arc<ChaosManager>,
    replica_id: ReplicaId,
    banned: AtomicBool,
}

impl TabletObserver {
    pub fn new(manager: Arc<ChaosManager>, replica_id: ReplicaId) -> Self {
        Self {
            manager,
            replica_id,
            banned: AtomicBool::new(false),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn set_banned(&self, banned: bool) {
        self.banned.store(banned, Ordering::SeqCst);
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::SeqCst)
    }

    /// Acknowledge the current card era on every lagging tablet
    ///
    /// Returns the acknowledged era, or `None` while banned.
    pub async fn observe(&self) -> ChaosResult<Option<Era>> {
        if self.is_banned() {
            return Ok(None);
        }
        let card = self.manager.get_card(self.replica_id.card_id).await?;
        let replica = card.replica(self.replica_id)?;
        for (tablet_index, acknowledged) in replica.tablet_eras().iter().enumerate() {
            if acknowledged.map_or(true, |known| known < card.era) {
                self.manager
                    .acknowledge_era(self.replica_id, tablet_index as u32, card.era)
                    .await?;
            }
        }
        Ok(Some(card.era))
    }

    /// Observe on every era change until shutdown or replica removal
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, period: Duration) {
        let mut status = match self.manager.card_entry(self.replica_id.card_id) {
            Ok(entry) => entry.subscribe(),
            Err(_) => return,
        };

        loop {
            match self.observe().await {
                Ok(_) => {}
                Err(ChaosError::NoSuchCard(_)) | Err(ChaosError::NoSuchReplica(_)) => break,
                Err(err) => log_warning(
                    Event::EraAcknowledged,
                    &[
                        ("replica_id", &self.replica_id.to_string()),
                        ("error", &err.to_string()),
                    ],
                ),
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(period) => {}
            }
        }
    }
}
