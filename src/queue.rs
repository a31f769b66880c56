//! In-memory queue of updates awaiting approval.
//!
//! The queue is volatile: it is rebuilt by every scan, so losing it on a
//! restart only delays approvals until the next scan.

use std::collections::BTreeMap;

use log::{debug, info};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::PendingUpdate;

#[derive(Default)]
pub struct UpdateQueue {
    pending: RwLock<BTreeMap<String, PendingUpdate>>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot ordered by canonical key.
    pub async fn list(&self) -> Vec<PendingUpdate> {
        self.pending.read().await.values().cloned().collect()
    }

    pub async fn get(&self, key: &str) -> Option<PendingUpdate> {
        self.pending.read().await.get(key).cloned()
    }

    /// Inserts or replaces the entry for the update's canonical key.
    pub async fn add(&self, update: PendingUpdate) {
        let key = update.key.canonical();
        let mut map = self.pending.write().await;
        if map.insert(key.clone(), update).is_some() {
            debug!("Replaced pending update for {}", key);
        } else {
            info!("Queued update for {}", key);
        }
    }

    /// Takes the entry out of the queue. Exactly one concurrent caller wins.
    pub async fn approve(&self, key: &str) -> Result<PendingUpdate> {
        let taken = self.pending.write().await.remove(key);
        match taken {
            Some(update) => {
                info!("Approved update for {}", key);
                Ok(update)
            }
            None => Err(Error::NotFound(format!("pending update {}", key))),
        }
    }

    pub async fn remove(&self, key: &str) {
        if self.pending.write().await.remove(key).is_some() {
            debug!("Dropped pending update for {}", key);
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }
}
