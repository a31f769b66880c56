//! Periodic scan that fills the update queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::time::{interval, MissedTickBehavior};

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::runtime::{Detection, RegistryChecker};
use crate::types::{Entity, PendingUpdate, Policy};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanSummary {
    pub scanned: usize,
    pub queued: usize,
    pub auto_updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scanner {
    coordinator: Arc<Coordinator>,
    checker: Arc<dyn RegistryChecker>,
    every: Duration,
}

impl Scanner {
    pub fn new(coordinator: Arc<Coordinator>, checker: Arc<dyn RegistryChecker>, every: Duration) -> Self {
        Self {
            coordinator,
            checker,
            every,
        }
    }

    /// Scans forever; a failed pass is retried on the next tick.
    pub async fn run(&self) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.scan_once().await {
                Ok(summary) => info!(
                    "Scan done: {} scanned, {} queued, {} auto-updated, {} skipped, {} failed",
                    summary.scanned,
                    summary.queued,
                    summary.auto_updated,
                    summary.skipped,
                    summary.failed
                ),
                Err(e) => error!("Scan failed: {}. Retrying in {:?}...", e, self.every),
            }
        }
    }

    pub async fn scan_once(&self) -> Result<ScanSummary> {
        let entities = self.coordinator.labels().entities().await?;
        let queue = self.coordinator.queue();
        let mut summary = ScanSummary::default();
        let mut seen = HashSet::new();

        for entity in entities {
            summary.scanned += 1;
            let key = entity.key.canonical();
            seen.insert(key.clone());

            if entity.is_self() {
                debug!("Skipping {}: managing instance", key);
                summary.skipped += 1;
                continue;
            }
            let policy = match self.coordinator.policy().resolve(&key, &entity.labels).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("Cannot resolve policy for {}: {}", key, e);
                    summary.failed += 1;
                    continue;
                }
            };
            if policy == Policy::Pinned {
                debug!("Skipping {}: pinned", key);
                queue.remove(&key).await;
                summary.skipped += 1;
                continue;
            }

            let detection = match self.checker.check(&entity).await {
                Ok(Some(d)) => d,
                Ok(None) => {
                    queue.remove(&key).await;
                    continue;
                }
                Err(e) => {
                    warn!("Registry check for {} failed: {}", key, e);
                    summary.failed += 1;
                    continue;
                }
            };

            match policy {
                Policy::Manual => {
                    queue.add(pending_update(&entity, detection)).await;
                    summary.queued += 1;
                }
                Policy::Auto => {
                    let update = pending_update(&entity, detection);
                    match self
                        .coordinator
                        .update(
                            &key,
                            Some(&update.target_image()),
                            Some(&update.remote_digest),
                        )
                        .await
                    {
                        Ok(_) => summary.auto_updated += 1,
                        Err(e) => {
                            warn!("Auto-update of {} failed: {}", key, e);
                            summary.failed += 1;
                        }
                    }
                }
                Policy::Pinned => {}
            }
        }

        // Entities that disappeared since their update was queued.
        for stale in queue.list().await {
            let key = stale.key.canonical();
            if !seen.contains(&key) {
                debug!("Dropping pending update for vanished {}", key);
                queue.remove(&key).await;
            }
        }
        Ok(summary)
    }
}

fn pending_update(entity: &Entity, detection: Detection) -> PendingUpdate {
    PendingUpdate {
        key: entity.key.clone(),
        id: entity.id.clone(),
        current_image: entity.image.clone(),
        current_digest: detection.current_digest,
        remote_digest: detection.remote_digest,
        detected_at: Utc::now(),
        newer_versions: detection.newer_versions,
        current_version: detection.current_version,
        target_version: detection.target_version,
        entity_type: entity.entity_type,
    }
}
