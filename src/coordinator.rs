//! Mutating entry points.
//!
//! Every action that changes an entity goes through [`Coordinator`], which
//! runs the self-protection guard before anything else and then routes the
//! action: local entities go to the [`LocalExecutor`] on a detached task,
//! remote entities are dispatched through the cluster.

use std::future::Future;
use std::sync::Arc;

use log::{error, info};
use serde::Serialize;

use crate::cluster::{Cluster, DispatchAck};
use crate::error::{Error, Result};
use crate::planner::{BulkPlan, BulkPolicyPlanner};
use crate::policy::{ensure_mutable, PolicyStore};
use crate::queue::UpdateQueue;
use crate::runtime::{LabelSource, LocalExecutor};
use crate::types::{ContainerAction, Entity, EntityKey, PendingUpdate, Policy};

/// How an accepted action was handed off.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "via", rename_all = "lowercase")]
pub enum Dispatched {
    /// Running on a local background task.
    Local,
    /// Acknowledged by the remote agent.
    Remote(DispatchAck),
}

pub struct Coordinator {
    queue: Arc<UpdateQueue>,
    policy: PolicyStore,
    cluster: Cluster,
    labels: Arc<dyn LabelSource>,
    executor: Arc<dyn LocalExecutor>,
}

impl Coordinator {
    pub fn new(
        queue: Arc<UpdateQueue>,
        policy: PolicyStore,
        cluster: Cluster,
        labels: Arc<dyn LabelSource>,
        executor: Arc<dyn LocalExecutor>,
    ) -> Self {
        Self {
            queue,
            policy,
            cluster,
            labels,
            executor,
        }
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn labels(&self) -> &dyn LabelSource {
        self.labels.as_ref()
    }

    /// Looks the entity up and refuses the managing instance.
    async fn guarded(&self, key: &EntityKey) -> Result<Entity> {
        let entity = self
            .labels
            .entity(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("entity {}", key)))?;
        ensure_mutable(&key.canonical(), &entity.labels)?;
        Ok(entity)
    }

    pub async fn effective_policy(&self, key: &str) -> Result<Policy> {
        let key = EntityKey::parse(key);
        let labels = self
            .labels
            .entity(&key)
            .await?
            .map(|e| e.labels)
            .unwrap_or_default();
        self.policy.resolve(&key.canonical(), &labels).await
    }

    /// Consumes the pending update and starts it. A remote host that
    /// cannot take the command leaves the entry queued.
    pub async fn approve(&self, key: &str) -> Result<(PendingUpdate, Dispatched)> {
        let parsed = EntityKey::parse(key);
        let entity = self.guarded(&parsed).await?;
        if let Some(host) = &parsed.host_id {
            self.cluster.ensure_dispatchable(host).await?;
        }
        let update = self.queue.approve(&parsed.canonical()).await?;
        let started = self
            .start_update(&entity, &update.target_image(), &update.remote_digest)
            .await;
        match started {
            Ok(dispatched) => Ok((update, dispatched)),
            Err(e) => {
                if refused_before_send(&e) {
                    self.queue.add(update).await;
                }
                Err(e)
            }
        }
    }

    /// Updates outside the queue, e.g. for `auto` entities or an operator
    /// request. Any pending entry for the entity is dropped once accepted.
    pub async fn update(
        &self,
        key: &str,
        target_image: Option<&str>,
        target_digest: Option<&str>,
    ) -> Result<Dispatched> {
        let parsed = EntityKey::parse(key);
        let entity = self.guarded(&parsed).await?;
        let canonical = parsed.canonical();
        let pending = self.queue.get(&canonical).await;
        let digest = target_digest.unwrap_or_default().to_string();
        let (image, digest) = match (target_image, &pending) {
            (Some(image), _) => (image.to_string(), digest),
            (None, Some(p)) => (p.target_image(), p.remote_digest.clone()),
            (None, None) => (entity.image.clone(), digest),
        };
        let dispatched = self.start_update(&entity, &image, &digest).await?;
        self.queue.remove(&canonical).await;
        Ok(dispatched)
    }

    pub async fn rollback(&self, key: &str) -> Result<Dispatched> {
        self.container_action(key, ContainerAction::Rollback).await
    }

    pub async fn container_action(&self, key: &str, action: ContainerAction) -> Result<Dispatched> {
        let parsed = EntityKey::parse(key);
        let entity = self.guarded(&parsed).await?;
        match &parsed.host_id {
            Some(host) => {
                let ack = self
                    .cluster
                    .remote_container_action(host, &parsed.name, action)
                    .await?;
                Ok(Dispatched::Remote(ack))
            }
            None => {
                let executor = Arc::clone(&self.executor);
                let what = format!("{} of {}", action, entity.key);
                spawn_detached(what, async move { executor.action(&entity, action).await });
                Ok(Dispatched::Local)
            }
        }
    }

    /// Sets an override. Entities no source knows about are allowed.
    pub async fn set_policy(&self, key: &str, policy: &str) -> Result<()> {
        let parsed = EntityKey::parse(key);
        let labels = self
            .labels
            .entity(&parsed)
            .await?
            .map(|e| e.labels)
            .unwrap_or_default();
        ensure_mutable(&parsed.canonical(), &labels)?;
        let policy: Policy = policy.parse()?;
        self.policy.set_override(&parsed.canonical(), policy).await
    }

    pub async fn delete_policy(&self, key: &str) -> Result<()> {
        let parsed = EntityKey::parse(key);
        let labels = self
            .labels
            .entity(&parsed)
            .await?
            .map(|e| e.labels)
            .unwrap_or_default();
        ensure_mutable(&parsed.canonical(), &labels)?;
        self.policy.delete_override(&parsed.canonical()).await
    }

    pub async fn bulk_policy(&self, names: &[String], target: &str, confirm: bool) -> Result<BulkPlan> {
        BulkPolicyPlanner::new(&self.policy, self.labels.as_ref())
            .run(names, target, confirm)
            .await
    }

    async fn start_update(&self, entity: &Entity, image: &str, digest: &str) -> Result<Dispatched> {
        match &entity.key.host_id {
            Some(host) => {
                let ack = self
                    .cluster
                    .update_remote_container(host, &entity.key.name, image, digest)
                    .await?;
                Ok(Dispatched::Remote(ack))
            }
            None => {
                let executor = Arc::clone(&self.executor);
                let entity = entity.clone();
                let image = image.to_string();
                let what = format!("update of {} to {}", entity.key, image);
                spawn_detached(what, async move { executor.update(&entity, &image).await });
                Ok(Dispatched::Local)
            }
        }
    }
}

/// Dispatch errors raised before the command reached the agent.
fn refused_before_send(e: &Error) -> bool {
    matches!(
        e,
        Error::HostPaused(_)
            | Error::HostNotConnected(_)
            | Error::Forbidden(_)
            | Error::NotFound(_)
            | Error::ServiceUnavailable(_)
    )
}

/// Runs `fut` on its own task; the outcome only reaches the log.
fn spawn_detached<F>(what: String, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    info!("Starting {}", what);
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => info!("Finished {}", what),
            Err(e) => error!("Failed {}: {}", what, e),
        }
    });
}
