//! Data structures used throughout the sentinel daemon.
//!
//! Entities (containers and Swarm services) are addressed by an
//! [`EntityKey`], whose canonical string form is shared by the update
//! queue, the policy store and the cluster controller.  Remote entities
//! are qualified by their host id so that a remote `web` and a local
//! `web` never collide.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Label carrying the per-entity default policy.
pub const POLICY_LABEL: &str = "sentinel.policy";

/// Label marking the managing instance itself.
pub const SELF_LABEL: &str = "sentinel.self";

/// Separator between host id and entity name in a canonical key.
pub const KEY_SEPARATOR: &str = "::";

/// Identity of a container or service, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    pub name: String,
}

impl EntityKey {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            host_id: None,
            name: name.into(),
        }
    }

    pub fn remote(host_id: impl Into<String>, name: impl Into<String>) -> Self {
        let host_id = host_id.into();
        Self {
            host_id: if host_id.is_empty() { None } else { Some(host_id) },
            name: name.into(),
        }
    }

    /// `name` for local entities, `host::name` for remote ones.
    pub fn canonical(&self) -> String {
        match &self.host_id {
            Some(host) => format!("{}{}{}", host, KEY_SEPARATOR, self.name),
            None => self.name.clone(),
        }
    }

    /// Inverse of [`EntityKey::canonical`]; splits on the first separator.
    pub fn parse(key: &str) -> Self {
        match key.split_once(KEY_SEPARATOR) {
            Some((host, name)) => Self::remote(host, name),
            None => Self::local(key),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.host_id.is_some()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Container,
    Service,
}

/// Update policy of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Updated by the scan loop without approval.
    Auto,
    /// Queued for approval.
    Manual,
    /// Never updated.
    Pinned,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Auto => "auto",
            Policy::Manual => "manual",
            Policy::Pinned => "pinned",
        }
    }

    /// Default policy derived from entity labels; invalid values are ignored.
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        labels
            .get(POLICY_LABEL)
            .and_then(|v| v.parse().ok())
            .unwrap_or(Policy::Manual)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Manual
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Policy::Auto),
            "manual" => Ok(Policy::Manual),
            "pinned" => Ok(Policy::Pinned),
            other => Err(Error::InvalidArgument(format!("unknown policy {:?}", other))),
        }
    }
}

/// Lifecycle action on a single container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Restart,
    Stop,
    Start,
    Rollback,
}

impl ContainerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Restart => "restart",
            ContainerAction::Stop => "stop",
            ContainerAction::Start => "start",
            ContainerAction::Rollback => "rollback",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container or service as seen by a label source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub id: String,
    pub image: String,
    /// Repo digest of the running image when the reporter already knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub entity_type: EntityType,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Entity {
    /// True for the entity running the managing instance.
    pub fn is_self(&self) -> bool {
        is_self_labelled(&self.labels)
    }
}

pub fn is_self_labelled(labels: &HashMap<String, String>) -> bool {
    labels
        .get(SELF_LABEL)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// An update waiting for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub key: EntityKey,
    pub id: String,
    pub current_image: String,
    pub current_digest: String,
    pub remote_digest: String,
    pub detected_at: DateTime<Utc>,
    /// Newer tags, newest first.
    #[serde(default)]
    pub newer_versions: Vec<String>,
    #[serde(default)]
    pub current_version: String,
    #[serde(default)]
    pub target_version: String,
    pub entity_type: EntityType,
}

impl PendingUpdate {
    /// Image reference the update should move to.
    pub fn target_image(&self) -> String {
        match self.newer_versions.first() {
            Some(tag) => with_tag(&self.current_image, tag),
            None => self.current_image.clone(),
        }
    }
}

/// Replace the tag of an image reference, keeping registry ports intact.
pub fn with_tag(image: &str, tag: &str) -> String {
    let base = image.split('@').next().unwrap_or(image);
    let repo = match base.rfind(':') {
        Some(idx) if !base[idx..].contains('/') => &base[..idx],
        _ => base,
    };
    format!("{}:{}", repo, tag)
}
