//! Card registry
//!
//! Every card sits behind its own async mutex. Operations on one card are
//! serialized, operations on different cards run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::card::ReplicationCard;
use crate::errors::{ChaosError, ChaosResult};
use crate::types::{CardId, Era};

/// Era and settled era of a card, as published to waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraStatus {
    pub era: Era,
    pub settled_era: Option<Era>,
}

impl EraStatus {
    fn of(card: &ReplicationCard) -> Self {
        Self {
            era: card.era(),
            settled_era: card.settled_era(),
        }
    }

    /// Whether every replica has acknowledged at least `era`
    pub fn is_settled_at(&self, era: Era) -> bool {
        self.settled_era.map_or(false, |settled| settled >= era)
    }
}

/// A registered card and its era status channel
#[derive(Debug)]
pub struct CardEntry {
    card: Mutex<ReplicationCard>,
    status: watch::Sender<EraStatus>,
}

impl CardEntry {
    fn new(card: ReplicationCard) -> Self {
        let (status, _) = watch::channel(EraStatus::of(&card));
        Self {
            card: Mutex::new(card),
            status,
        }
    }

    /// Acquire the card lock
    pub async fn lock(&self) -> MutexGuard<'_, ReplicationCard> {
        self.card.lock().await
    }

    /// Publish the era status of `card` if it changed
    pub fn publish(&self, card: &ReplicationCard) {
        let status = EraStatus::of(card);
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub fn status(&self) -> EraStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EraStatus> {
        self.status.subscribe()
    }
}

/// Cards hosted by a cell
#[derive(Debug, Default)]
pub struct CardRegistry {
    cards: RwLock<HashMap<CardId, Arc<CardEntry>>>,
}

impl CardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, card: ReplicationCard) -> ChaosResult<Arc<CardEntry>> {
        let mut cards = self.write()?;
        let card_id = card.card_id();
        if cards.contains_key(&card_id) {
            return Err(ChaosError::CardAlreadyExists(card_id));
        }
        let entry = Arc::new(CardEntry::new(card));
        cards.insert(card_id, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, card_id: CardId) -> ChaosResult<Arc<CardEntry>> {
        self.read()?
            .get(&card_id)
            .cloned()
            .ok_or(ChaosError::NoSuchCard(card_id))
    }

    pub fn remove(&self, card_id: CardId) -> ChaosResult<Arc<CardEntry>> {
        self.write()?
            .remove(&card_id)
            .ok_or(ChaosError::NoSuchCard(card_id))
    }

    pub fn contains(&self, card_id: CardId) -> bool {
        self.read().map_or(false, |cards| cards.contains_key(&card_id))
    }

    /// Card ids in a stable order
    pub fn card_ids(&self) -> ChaosResult<Vec<CardId>> {
        let mut ids: Vec<CardId> = self.read()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn len(&self) -> usize {
        self.read().map_or(0, |cards| cards.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> ChaosResult<std::sync::RwLockReadGuard<'_, HashMap<CardId, Arc<CardEntry>>>> {
        self.cards
            .read()
            .map_err(|_| ChaosError::Internal("card registry lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> ChaosResult<std::sync::RwLockWriteGuard<'_, HashMap<CardId, Arc<CardEntry>>>> {
        self.cards
            .write()
            .map_err(|_| ChaosError::Internal("card registry lock poisoned".into()))
    }
}
