use super::{Detection, LabelSource, LocalExecutor, RegistryChecker};
use crate::error::{Error, Result};
use crate::types::{ContainerAction, Entity, EntityKey, EntityType};
use async_trait::async_trait;
use bollard::container::{
    ListContainersOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::ListServicesOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};

/// Label Docker sets on containers that are Swarm tasks.
const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.name";

/// Seconds Docker waits before killing a container on stop/restart.
const STOP_TIMEOUT_SECS: i64 = 10;

pub struct DockerRuntime {
    docker: Docker,
    swarm: bool,
}

impl DockerRuntime {
    pub fn new(swarm: bool) -> Result<Self> {
        // DOCKER_HOST, else the platform socket.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, swarm })
    }

    /// Liveness probe run once at startup.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn containers(&self) -> Result<Vec<Entity>> {
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        let mut out = Vec::with_capacity(containers.len());
        for c in containers {
            let labels = c.labels.unwrap_or_default();
            // Swarm tasks are reported through their service.
            if self.swarm && labels.contains_key(SWARM_SERVICE_LABEL) {
                continue;
            }
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string());
            let id = c.id.unwrap_or_default();
            let name = match name {
                Some(n) => n,
                None if !id.is_empty() => id.clone(),
                None => continue,
            };
            out.push(Entity {
                key: EntityKey::local(name),
                id,
                image: c.image.unwrap_or_default(),
                digest: None,
                entity_type: EntityType::Container,
                labels,
            });
        }
        Ok(out)
    }

    async fn services(&self) -> Result<Vec<Entity>> {
        let services = self
            .docker
            .list_services(Some(ListServicesOptions::<String>::default()))
            .await?;

        let mut out = Vec::with_capacity(services.len());
        for s in services {
            let Some(spec) = s.spec else { continue };
            let Some(name) = spec.name else { continue };
            let image = spec
                .task_template
                .and_then(|t| t.container_spec)
                .and_then(|c| c.image)
                .unwrap_or_default();
            // Service images are pinned as repo:tag@digest.
            let (image, digest) = match image.split_once('@') {
                Some((image, digest)) => (image.to_string(), Some(digest.to_string())),
                None => (image, None),
            };
            out.push(Entity {
                key: EntityKey::local(name),
                id: s.id.unwrap_or_default(),
                image,
                digest,
                entity_type: EntityType::Service,
                labels: spec.labels.unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn local_digest(&self, image: &str) -> Result<Option<String>> {
        let detail = self.docker.inspect_image(image).await?;
        Ok(detail
            .repo_digests
            .unwrap_or_default()
            .iter()
            .find_map(|d| d.split_once('@').map(|(_, digest)| digest.to_string())))
    }
}

#[async_trait]
impl LabelSource for DockerRuntime {
    async fn entities(&self) -> Result<Vec<Entity>> {
        let mut all = self.containers().await?;
        if self.swarm {
            match self.services().await {
                Ok(services) => all.extend(services),
                Err(e) => warn!("Failed to list Swarm services: {}", e),
            }
        }
        Ok(all)
    }
}

#[async_trait]
impl RegistryChecker for DockerRuntime {
    async fn check(&self, entity: &Entity) -> Result<Option<Detection>> {
        if entity.image.is_empty() || entity.image.starts_with("sha256:") {
            debug!("Skipping {}: image has no registry reference", entity.key);
            return Ok(None);
        }
        let current = match &entity.digest {
            Some(digest) => Some(digest.clone()),
            None if entity.key.is_remote() => None,
            None => self.local_digest(&entity.image).await?,
        };
        // Locally built images have no repo digest and nothing to compare to.
        let Some(current) = current else {
            return Ok(None);
        };
        let remote = self
            .docker
            .inspect_registry_image(&entity.image, None)
            .await?
            .descriptor
            .digest
            .unwrap_or_default();

        if remote.is_empty() || remote == current {
            return Ok(None);
        }
        Ok(Some(Detection {
            current_digest: current,
            remote_digest: remote,
            ..Default::default()
        }))
    }
}

#[async_trait]
impl LocalExecutor for DockerRuntime {
    /// Stages the target image. Recreating the container from it is
    /// handled by the deployment tooling that owns the container spec.
    async fn update(&self, entity: &Entity, target_image: &str) -> Result<()> {
        info!("Pulling {} for {}", target_image, entity.key);
        let opts = CreateImageOptions {
            from_image: target_image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!("{}: {}", target_image, status);
            }
        }
        info!("Image {} ready for {}", target_image, entity.key);
        Ok(())
    }

    async fn action(&self, entity: &Entity, action: ContainerAction) -> Result<()> {
        if entity.entity_type == EntityType::Service {
            return Err(Error::InvalidArgument(format!(
                "{} is a Swarm service; {} applies to containers only",
                entity.key, action
            )));
        }
        let name = entity.key.name.as_str();
        match action {
            ContainerAction::Restart => {
                self.docker
                    .restart_container(
                        name,
                        Some(RestartContainerOptions {
                            t: STOP_TIMEOUT_SECS as isize,
                        }),
                    )
                    .await?
            }
            ContainerAction::Stop => {
                self.docker
                    .stop_container(name, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
                    .await?
            }
            ContainerAction::Start => {
                self.docker
                    .start_container(name, None::<StartContainerOptions<String>>)
                    .await?
            }
            ContainerAction::Rollback => {
                return Err(Error::Runtime(format!(
                    "no previous image recorded for {}",
                    name
                )))
            }
        }
        info!("Container {}: {} done", name, action);
        Ok(())
    }
}

