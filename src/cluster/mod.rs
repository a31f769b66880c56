//! Fleet coordination for remote agent hosts.
//!
//! Clustering is optional.  [`Cluster`] is always present and is either
//! `Disabled`, where every operation fails `ServiceUnavailable`, or
//! `Enabled` with a running [`ClusterController`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ContainerAction, Entity, EntityKey};

pub mod controller;
pub mod enrollment;
pub mod transport;
pub mod trust;

pub use controller::{ClusterController, ClusterSettings, EnrollRequest, Enrollment};
pub use enrollment::GeneratedToken;
pub use transport::{AgentCommand, AgentTransport, ChannelTransport, DispatchAck, TransportEvent};
pub use trust::{CredentialLedger, CredentialRef, HostCredential, TrustAuthority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Enrolling,
    Active,
    Paused,
    Revoked,
    Decommissioned,
}

impl HostState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostState::Revoked | HostState::Decommissioned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Enrolling => "enrolling",
            HostState::Active => "active",
            HostState::Paused => "paused",
            HostState::Revoked => "revoked",
            HostState::Decommissioned => "decommissioned",
        }
    }
}

/// Coarse classification of why an agent connection dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCategory {
    Graceful,
    Timeout,
    Network,
    Tls,
    ConnectionLost,
    Other,
}

impl DisconnectCategory {
    pub fn classify(error: &str) -> Self {
        let e = error.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| e.contains(n));
        if e.trim().is_empty() {
            DisconnectCategory::Graceful
        } else if has(&["timeout", "timed out", "deadline"]) {
            DisconnectCategory::Timeout
        } else if has(&["certificate", "tls", "x509", "handshake"]) {
            DisconnectCategory::Tls
        } else if has(&["refused", "unreachable", "no route", "dns"]) {
            DisconnectCategory::Network
        } else if has(&["eof", "reset", "broken pipe", "closed"]) {
            DisconnectCategory::ConnectionLost
        } else {
            DisconnectCategory::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectRecord {
    pub at: DateTime<Utc>,
    pub error: String,
    pub category: DisconnectCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHost {
    pub id: String,
    pub name: String,
    pub address: String,
    pub state: HostState,
    pub enrolled_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub container_count: usize,
    #[serde(default)]
    pub last_disconnect: Option<DisconnectRecord>,
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    /// Last inventory reported by the agent, keys qualified by host id.
    #[serde(default)]
    pub inventory: Vec<Entity>,
}

/// Host record plus its live connection status.
#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    #[serde(flatten)]
    pub host: ClusterHost,
    pub connected: bool,
}

#[derive(Clone)]
pub enum Cluster {
    Disabled,
    Enabled(Arc<ClusterController>),
}

impl Cluster {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Cluster::Enabled(_))
    }

    fn controller(&self) -> Result<&Arc<ClusterController>> {
        match self {
            Cluster::Enabled(c) => Ok(c),
            Cluster::Disabled => Err(Error::cluster_disabled()),
        }
    }

    pub async fn all_hosts(&self) -> Result<Vec<HostView>> {
        Ok(self.controller()?.all_hosts().await)
    }

    pub async fn get_host(&self, id: &str) -> Result<HostView> {
        self.controller()?.get_host(id).await
    }

    pub async fn connected_hosts(&self) -> Result<Vec<String>> {
        Ok(self.controller()?.connected_hosts().await)
    }

    pub async fn generate_enroll_token(&self) -> Result<GeneratedToken> {
        self.controller()?.generate_enroll_token().await
    }

    pub async fn redeem_enrollment(&self, token: &str, request: EnrollRequest) -> Result<Enrollment> {
        self.controller()?.redeem_enrollment(token, request).await
    }

    pub async fn remove_host(&self, id: &str) -> Result<ClusterHost> {
        self.controller()?.remove_host(id).await
    }

    pub async fn revoke_host(&self, id: &str) -> Result<ClusterHost> {
        self.controller()?.revoke_host(id).await
    }

    pub async fn pause_host(&self, id: &str) -> Result<ClusterHost> {
        self.controller()?.pause_host(id).await
    }

    pub async fn resume_host(&self, id: &str) -> Result<ClusterHost> {
        self.controller()?.resume_host(id).await
    }

    pub async fn ensure_dispatchable(&self, host_id: &str) -> Result<()> {
        self.controller()?.ensure_dispatchable(host_id).await
    }

    pub async fn update_remote_container(
        &self,
        host_id: &str,
        name: &str,
        target_image: &str,
        target_digest: &str,
    ) -> Result<DispatchAck> {
        self.controller()?
            .update_remote_container(host_id, name, target_image, target_digest)
            .await
    }

    pub async fn remote_container_action(
        &self,
        host_id: &str,
        name: &str,
        action: ContainerAction,
    ) -> Result<DispatchAck> {
        self.controller()?
            .remote_container_action(host_id, name, action)
            .await
    }

    pub async fn all_host_containers(&self) -> Result<Vec<Entity>> {
        Ok(self.controller()?.all_host_containers().await)
    }

    pub async fn host_container(&self, key: &EntityKey) -> Result<Option<Entity>> {
        self.controller()?.host_container(key).await
    }
}

/// Hex string of `bytes` random bytes from the OS generator.
pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_categories() {
        assert_eq!(DisconnectCategory::classify(""), DisconnectCategory::Graceful);
        assert_eq!(
            DisconnectCategory::classify("read: i/o timeout"),
            DisconnectCategory::Timeout
        );
        assert_eq!(
            DisconnectCategory::classify("tls: bad certificate"),
            DisconnectCategory::Tls
        );
        assert_eq!(
            DisconnectCategory::classify("dial tcp: connection refused"),
            DisconnectCategory::Network
        );
        assert_eq!(
            DisconnectCategory::classify("connection reset by peer"),
            DisconnectCategory::ConnectionLost
        );
        assert_eq!(DisconnectCategory::classify("weird"), DisconnectCategory::Other);
    }

    #[tokio::test]
    async fn disabled_cluster_is_unavailable() {
        let cluster = Cluster::Disabled;
        assert!(!cluster.is_enabled());
        assert!(matches!(
            cluster.all_hosts().await,
            Err(Error::ServiceUnavailable(_))
        ));
        assert!(matches!(
            cluster.generate_enroll_token().await,
            Err(Error::ServiceUnavailable(_))
        ));
        assert!(matches!(
            cluster
                .remote_container_action("h1", "web", ContainerAction::Restart)
                .await,
            Err(Error::ServiceUnavailable(_))
        ));
    }
}
