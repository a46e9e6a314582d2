//! Waiting for era settlement
//!
//! A waiter follows the era status channel of the card and re-checks the
//! registry on a doubling backoff. Dropping the wait cancels it and leaves
//! the card untouched.

use std::time::Duration;

use crate::errors::{ChaosError, ChaosResult};
use crate::manager::{ChaosManager, EraStatus};
use crate::types::{CardId, Era};

/// Backoff between registry re-checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for SettlementBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(1000),
        }
    }
}

impl SettlementBackoff {
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Wait until every replica of the card has acknowledged `era`
///
/// Fails with `EraNotSettled` after `timeout`; the caller retries.
pub async fn wait_for_era_settlement(
    manager: &ChaosManager,
    card_id: CardId,
    era: Era,
    timeout: Duration,
    backoff: SettlementBackoff,
) -> ChaosResult<EraStatus> {
    let mut status = manager.card_entry(card_id)?.subscribe();

    let wait = async {
        let mut delay = backoff.initial;
        loop {
            let current = *status.borrow_and_update();
            if current.is_settled_at(era) {
                return Ok(current);
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(ChaosError::NoSuchCard(card_id));
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    delay = backoff.next(delay);
                    if manager.card_entry(card_id).is_err() {
                        return Err(ChaosError::NoSuchCard(card_id));
                    }
                }
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(ChaosError::EraNotSettled { card_id, era }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::manager::{CreateCardRequest, CreateReplicaRequest, ManagerOptions};
    use crate::observability::MetricsRegistry;
    use crate::replica::{ContentType, ReplicaAttributes, ReplicaMode};
    use crate::types::Timestamp;

    fn manager() -> Arc<ChaosManager> {
        Arc::new(ChaosManager::new(
            Arc::new(ManualClock::new(None, Timestamp::from_parts(1, 0))),
            Arc::new(MetricsRegistry::new()),
            ManagerOptions::default(),
        ))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = SettlementBackoff::default();
        assert_eq!(backoff.next(Duration::from_millis(50)), Duration::from_millis(100));
        assert_eq!(backoff.next(Duration::from_millis(800)), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_times_out_while_unacknowledged() {
        let manager = manager();
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

        let err = wait_for_era_settlement(
            &manager,
            card_id,
            0,
            Duration::from_millis(30),
            SettlementBackoff::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChaosError::EraNotSettled { era: 0, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_wakes_on_acknowledgement() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        let replica_id = manager
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

        let acker = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            acker.acknowledge_era(replica_id, 0, 0).await
        });

        let status = wait_for_era_settlement(
            &manager,
            card_id,
            0,
            Duration::from_secs(5),
            SettlementBackoff::default(),
        )
        .await
        .unwrap();
        assert_eq!(status.settled_era, Some(0));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_removed_card() {
        let manager = manager();
        let card_id = manager.create_card(CreateCardRequest::default()).unwrap();
        manager.remove_card(card_id).await.unwrap();
        let err = wait_for_era_settlement(
            &manager,
            card_id,
            1,
            Duration::from_secs(1),
            SettlementBackoff::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChaosError::NoSuchCard(_)));
    }
}
