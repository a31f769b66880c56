use async_trait::async_trait;

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::types::{ContainerAction, Entity, EntityKey};
use std::sync::Arc;

pub mod docker;
pub use docker::DockerRuntime;

/// Source of entities and their labels.
#[async_trait]
pub trait LabelSource: Send + Sync {
    async fn entities(&self) -> Result<Vec<Entity>>;

    async fn entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self.entities().await?.into_iter().find(|e| &e.key == key))
    }
}

/// Result of comparing an entity's image against its registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub current_digest: String,
    pub remote_digest: String,
    /// Newer tags, newest first. Empty when only the digest moved.
    pub newer_versions: Vec<String>,
    pub current_version: String,
    pub target_version: String,
}

#[async_trait]
pub trait RegistryChecker: Send + Sync {
    /// `None` when the entity is up to date.
    async fn check(&self, entity: &Entity) -> Result<Option<Detection>>;
}

/// Executes actions against local entities. Called from detached tasks.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn update(&self, entity: &Entity, target_image: &str) -> Result<()>;

    async fn action(&self, entity: &Entity, action: ContainerAction) -> Result<()>;
}

/// Local entities plus the last inventories reported by connected agents.
pub struct FleetLabels {
    local: Arc<dyn LabelSource>,
    cluster: Cluster,
}

impl FleetLabels {
    pub fn new(local: Arc<dyn LabelSource>, cluster: Cluster) -> Self {
        Self { local, cluster }
    }
}

#[async_trait]
impl LabelSource for FleetLabels {
    async fn entities(&self) -> Result<Vec<Entity>> {
        let mut all = self.local.entities().await?;
        match self.cluster.all_host_containers().await {
            Ok(remote) => all.extend(remote),
            Err(Error::ServiceUnavailable(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(all)
    }

    async fn entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        if !key.is_remote() {
            return self.local.entity(key).await;
        }
        // Inventory of a disconnected host still carries its labels, so the
        // self-protection guard keeps working while the host is offline.
        match self.cluster.host_container(key).await {
            Ok(found) => Ok(found),
            Err(Error::ServiceUnavailable(_)) | Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
