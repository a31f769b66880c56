//! Host registry, enrollment and command dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use super::enrollment::{EnrollmentToken, GeneratedToken, TokenLedger};
use super::transport::{AgentCommand, AgentTransport, DispatchAck, TransportEvent};
use super::trust::{CredentialRef, HostCredential, TrustAuthority};
use super::{random_hex, ClusterHost, DisconnectCategory, DisconnectRecord, HostState, HostView};
use crate::error::{Error, Result};
use crate::store::{decode, encode, KeyValueStore};
use crate::types::{ContainerAction, Entity, EntityKey};

const BUCKET: &str = "hosts";

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub enroll_token_ttl: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enroll_token_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// What an agent presents alongside its token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub agent_version: String,
}

/// Result of a successful enrollment; the credential is shown only here.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub host: ClusterHost,
    pub credential: HostCredential,
    pub token: EnrollmentToken,
}

pub struct ClusterController {
    hosts: RwLock<HashMap<String, ClusterHost>>,
    // Serialises host writes so the newest record is always the one persisted.
    persist_lock: Mutex<()>,
    store: Arc<dyn KeyValueStore>,
    tokens: TokenLedger,
    transport: Arc<dyn AgentTransport>,
    authority: Arc<dyn TrustAuthority>,
}

impl ClusterController {
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn AgentTransport>,
        authority: Arc<dyn TrustAuthority>,
        settings: ClusterSettings,
    ) -> Result<Self> {
        let mut hosts = HashMap::new();
        for (id, bytes) in store.list(BUCKET).await? {
            let host: ClusterHost = decode("load host", &id, &bytes)?;
            hosts.insert(id, host);
        }
        info!("Cluster controller loaded {} hosts", hosts.len());

        let tokens = TokenLedger::load(Arc::clone(&store), settings.enroll_token_ttl).await?;
        Ok(Self {
            hosts: RwLock::new(hosts),
            persist_lock: Mutex::new(()),
            store,
            tokens,
            transport,
            authority,
        })
    }

    async fn persist_host(&self, id: &str) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let current = self.hosts.read().await.get(id).cloned();
        match current {
            Some(host) => {
                let bytes = encode("write host", id, &host)?;
                self.store.put(BUCKET, id, bytes).await
            }
            None => self.store.delete(BUCKET, id).await.map(|_| ()),
        }
    }

    /// Applies `f` to the host record under the registry lock and persists it.
    async fn mutate_host<F>(&self, id: &str, f: F) -> Result<ClusterHost>
    where
        F: FnOnce(&mut ClusterHost) -> Result<()>,
    {
        let updated = {
            let mut hosts = self.hosts.write().await;
            let host = hosts
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("host {}", id)))?;
            f(host)?;
            host.clone()
        };
        self.persist_host(id).await?;
        Ok(updated)
    }

    pub async fn all_hosts(&self) -> Vec<HostView> {
        let connected = self.transport.connected().await;
        let mut out: Vec<HostView> = self
            .hosts
            .read()
            .await
            .values()
            .map(|h| HostView {
                connected: connected.contains(&h.id),
                host: h.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.host.name.cmp(&b.host.name).then(a.host.id.cmp(&b.host.id)));
        out
    }

    pub async fn get_host(&self, id: &str) -> Result<HostView> {
        let host = self
            .hosts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("host {}", id)))?;
        let connected = self.transport.connected().await.contains(id);
        Ok(HostView { host, connected })
    }

    pub async fn connected_hosts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.transport.connected().await.into_iter().collect();
        ids.sort();
        ids
    }

    pub async fn generate_enroll_token(&self) -> Result<GeneratedToken> {
        self.tokens.generate().await
    }

    pub async fn enrollment_tokens(&self) -> Vec<EnrollmentToken> {
        self.tokens.list().await
    }

    /// Admits a new host. This is the only way a host record is created.
    pub async fn redeem_enrollment(&self, token: &str, request: EnrollRequest) -> Result<Enrollment> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidArgument("host name is required".into()));
        }
        let consumed = self.tokens.redeem(token, &request.name).await?;

        let id = random_hex(8);
        let host = ClusterHost {
            id: id.clone(),
            name: request.name.clone(),
            address: request.address.clone(),
            state: HostState::Enrolling,
            enrolled_at: Utc::now(),
            last_seen: None,
            agent_version: request.agent_version.clone(),
            container_count: 0,
            last_disconnect: None,
            credential: None,
            inventory: Vec::new(),
        };
        self.hosts.write().await.insert(id.clone(), host);

        let credential = match self.authority.issue(&id).await {
            Ok(c) => c,
            Err(e) => {
                self.hosts.write().await.remove(&id);
                error!("Enrollment of {} failed issuing credential: {}", request.name, e);
                return Err(e);
            }
        };

        let activated = self
            .mutate_host(&id, |h| {
                h.credential = Some(CredentialRef {
                    serial: credential.serial.clone(),
                    fingerprint: credential.fingerprint(),
                });
                h.state = HostState::Active;
                Ok(())
            })
            .await;
        let host = match activated {
            Ok(host) => host,
            Err(e) => {
                // The agent never sees this credential; leave no trace of the host.
                self.hosts.write().await.remove(&id);
                if let Err(revoke) = self.authority.revoke(&credential.serial).await {
                    warn!("Failed to revoke credential {}: {}", credential.serial, revoke);
                }
                error!("Enrollment of {} failed persisting host: {}", request.name, e);
                return Err(e);
            }
        };
        info!(
            "Host {} ({}) enrolled with token {}",
            host.name, host.id, consumed.id
        );
        Ok(Enrollment {
            host,
            credential,
            token: consumed,
        })
    }

    /// Deletes the host record. A live session is left to the transport.
    pub async fn remove_host(&self, id: &str) -> Result<ClusterHost> {
        let mut removed = {
            let _guard = self.persist_lock.lock().await;
            if !self.hosts.read().await.contains_key(id) {
                return Err(Error::NotFound(format!("host {}", id)));
            }
            // Durable delete first so a failure leaves the host fully in place.
            self.store.delete(BUCKET, id).await?;
            self.hosts
                .write()
                .await
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("host {}", id)))?
        };
        removed.state = HostState::Decommissioned;

        if let Some(cred) = &removed.credential {
            if let Err(e) = self.authority.revoke(&cred.serial).await {
                warn!("Failed to revoke credential of removed host {}: {}", id, e);
            }
        }
        info!("Host {} ({}) decommissioned", removed.name, id);
        Ok(removed)
    }

    /// Irreversibly revokes the host and its credential.
    pub async fn revoke_host(&self, id: &str) -> Result<ClusterHost> {
        // Mark the host first so dispatch is refused even if revoking the
        // credential fails; a retry re-attempts the credential.
        let host = self
            .mutate_host(id, |h| match h.state {
                HostState::Decommissioned => Err(Error::InvalidArgument(format!(
                    "host {} is decommissioned",
                    id
                ))),
                _ => {
                    h.state = HostState::Revoked;
                    Ok(())
                }
            })
            .await?;
        if let Some(cred) = &host.credential {
            self.authority.revoke(&cred.serial).await?;
        }
        info!("Host {} ({}) revoked", host.name, id);
        Ok(host)
    }

    pub async fn pause_host(&self, id: &str) -> Result<ClusterHost> {
        let host = self
            .mutate_host(id, |h| match h.state {
                HostState::Active | HostState::Paused => {
                    h.state = HostState::Paused;
                    Ok(())
                }
                other => Err(Error::InvalidArgument(format!(
                    "cannot pause host {} in state {}",
                    id,
                    other.as_str()
                ))),
            })
            .await?;
        info!("Host {} ({}) paused", host.name, id);
        Ok(host)
    }

    pub async fn resume_host(&self, id: &str) -> Result<ClusterHost> {
        let host = self
            .mutate_host(id, |h| match h.state {
                HostState::Active | HostState::Paused => {
                    h.state = HostState::Active;
                    Ok(())
                }
                other => Err(Error::InvalidArgument(format!(
                    "cannot resume host {} in state {}",
                    id,
                    other.as_str()
                ))),
            })
            .await?;
        info!("Host {} ({}) resumed", host.name, id);
        Ok(host)
    }

    pub async fn update_remote_container(
        &self,
        host_id: &str,
        name: &str,
        target_image: &str,
        target_digest: &str,
    ) -> Result<DispatchAck> {
        let command = AgentCommand::UpdateContainer {
            request_id: random_hex(8),
            name: name.to_string(),
            target_image: target_image.to_string(),
            target_digest: target_digest.to_string(),
        };
        self.dispatch(host_id, command).await
    }

    pub async fn remote_container_action(
        &self,
        host_id: &str,
        name: &str,
        action: ContainerAction,
    ) -> Result<DispatchAck> {
        let command = AgentCommand::ContainerAction {
            request_id: random_hex(8),
            name: name.to_string(),
            action,
        };
        self.dispatch(host_id, command).await
    }

    /// Whether a command for `host_id` would be accepted for sending now.
    pub async fn ensure_dispatchable(&self, host_id: &str) -> Result<()> {
        let state = self
            .hosts
            .read()
            .await
            .get(host_id)
            .map(|h| h.state)
            .ok_or_else(|| Error::NotFound(format!("host {}", host_id)))?;
        match state {
            HostState::Active => {}
            HostState::Paused => return Err(Error::HostPaused(host_id.to_string())),
            other => {
                return Err(Error::Forbidden(format!(
                    "host {} is {}",
                    host_id,
                    other.as_str()
                )))
            }
        }
        if !self.transport.connected().await.contains(host_id) {
            return Err(Error::HostNotConnected(host_id.to_string()));
        }
        Ok(())
    }

    /// Hands the command to a detached task and waits only for the agent's
    /// acknowledgement. Dropping the returned future does not cancel the
    /// dispatch; its outcome is then only logged.
    async fn dispatch(&self, host_id: &str, command: AgentCommand) -> Result<DispatchAck> {
        self.ensure_dispatchable(host_id).await?;

        let transport = Arc::clone(&self.transport);
        let host = host_id.to_string();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let request_id = command.request_id().to_string();
            let result = transport.dispatch(&host, command).await;
            match &result {
                Ok(_) => info!("Host {} acknowledged request {}", host, request_id),
                Err(e) => warn!("Dispatch of request {} to {} failed: {}", request_id, host, e),
            }
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| Error::transport(host_id, "dispatch task ended without a result"))?
    }

    /// Inventories of connected, non-terminal hosts as one host-tagged list.
    pub async fn all_host_containers(&self) -> Vec<Entity> {
        let connected = self.transport.connected().await;
        let hosts = self.hosts.read().await;
        let mut out: Vec<Entity> = hosts
            .values()
            .filter(|h| connected.contains(&h.id) && !h.state.is_terminal())
            .flat_map(|h| h.inventory.iter().cloned())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Last reported entity for a remote key, whether or not the host is online.
    pub async fn host_container(&self, key: &EntityKey) -> Result<Option<Entity>> {
        let host_id = key
            .host_id
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not a remote key", key)))?;
        let hosts = self.hosts.read().await;
        let host = hosts
            .get(host_id)
            .ok_or_else(|| Error::NotFound(format!("host {}", host_id)))?;
        Ok(host.inventory.iter().find(|e| e.key.name == key.name).cloned())
    }

    pub async fn record_heartbeat(
        &self,
        host_id: &str,
        agent_version: &str,
        containers: Vec<Entity>,
    ) -> Result<()> {
        let mut hosts = self.hosts.write().await;
        let host = hosts
            .get_mut(host_id)
            .ok_or_else(|| Error::NotFound(format!("host {}", host_id)))?;
        if host.state.is_terminal() {
            return Err(Error::Forbidden(format!(
                "host {} is {}",
                host_id,
                host.state.as_str()
            )));
        }
        host.last_seen = Some(Utc::now());
        if !agent_version.is_empty() {
            host.agent_version = agent_version.to_string();
        }
        // Agents report local names; qualify them so remote keys never
        // collide with local ones.
        host.inventory = containers
            .into_iter()
            .map(|mut e| {
                e.key = EntityKey::remote(host_id, e.key.name);
                e
            })
            .collect();
        host.container_count = host.inventory.len();
        Ok(())
    }

    /// Best-effort; an unknown host is ignored.
    pub async fn record_disconnect(&self, host_id: &str, error: &str) {
        let record = DisconnectRecord {
            at: Utc::now(),
            error: error.to_string(),
            category: DisconnectCategory::classify(error),
        };
        let result = self
            .mutate_host(host_id, |h| {
                h.last_disconnect = Some(record);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            debug!("Disconnect of {} not recorded: {}", host_id, e);
        }
    }

    /// Applies transport events until the channel closes.
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected { host_id } => {
                    let seen = self
                        .mutate_host(&host_id, |h| {
                            h.last_seen = Some(Utc::now());
                            Ok(())
                        })
                        .await;
                    if let Err(e) = seen {
                        warn!("Connection from unregistered host {}: {}", host_id, e);
                    }
                }
                TransportEvent::Heartbeat {
                    host_id,
                    agent_version,
                    containers,
                } => {
                    if let Err(e) = self
                        .record_heartbeat(&host_id, &agent_version, containers)
                        .await
                    {
                        warn!("Ignoring heartbeat from {}: {}", host_id, e);
                    }
                }
                TransportEvent::ActionResult {
                    host_id,
                    request_id,
                    error,
                } => match error {
                    None => info!("Host {} completed request {}", host_id, request_id),
                    Some(e) => warn!("Host {} failed request {}: {}", host_id, request_id, e),
                },
                TransportEvent::Disconnected { host_id, error } => {
                    self.record_disconnect(&host_id, &error).await;
                }
            }
        }
        info!("Transport event channel closed, stopping event handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::transport::{AgentSession, ChannelTransport};
    use crate::cluster::trust::CredentialLedger;
    use crate::store::MemoryStore;
    use crate::types::EntityType;

    struct Fixture {
        controller: Arc<ClusterController>,
        transport: Arc<ChannelTransport>,
        _events: mpsc::Receiver<TransportEvent>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CredentialLedger::load(Arc::clone(&store)).await.unwrap());
        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(ChannelTransport::new(
            ledger.clone(),
            tx,
            Duration::from_secs(2),
        ));
        let controller = ClusterController::load(
            store,
            transport.clone(),
            ledger,
            ClusterSettings::default(),
        )
        .await
        .unwrap();
        Fixture {
            controller: Arc::new(controller),
            transport,
            _events: rx,
        }
    }

    fn request(name: &str) -> EnrollRequest {
        EnrollRequest {
            name: name.into(),
            address: "10.0.0.5:9443".into(),
            agent_version: "1.2.0".into(),
        }
    }

    async fn enroll(f: &Fixture, name: &str) -> (Enrollment, AgentSession) {
        let token = f.controller.generate_enroll_token().await.unwrap();
        let enrollment = f
            .controller
            .redeem_enrollment(&token.token, request(name))
            .await
            .unwrap();
        let session = f
            .transport
            .attach(&enrollment.host.id, &enrollment.credential)
            .await
            .unwrap();
        (enrollment, session)
    }

    fn acking_agent(mut session: AgentSession) -> tokio::task::JoinHandle<Vec<AgentCommand>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(envelope) = session.next_command().await {
                seen.push(envelope.acknowledge());
            }
            seen
        })
    }

    #[tokio::test]
    async fn enrollment_creates_active_host() {
        let f = fixture().await;
        let token = f.controller.generate_enroll_token().await.unwrap();
        let enrollment = f
            .controller
            .redeem_enrollment(&token.token, request("edge-1"))
            .await
            .unwrap();
        assert_eq!(enrollment.host.state, HostState::Active);
        assert!(enrollment.host.credential.is_some());

        let again = f
            .controller
            .redeem_enrollment(&token.token, request("edge-2"))
            .await;
        assert!(matches!(again, Err(Error::Token(_))));
        assert_eq!(f.controller.all_hosts().await.len(), 1);
    }

    #[tokio::test]
    async fn host_views_reflect_connection_set() {
        let f = fixture().await;
        let (enrollment, session) = enroll(&f, "edge-1").await;
        let id = enrollment.host.id.clone();

        assert!(f.controller.get_host(&id).await.unwrap().connected);
        assert_eq!(f.controller.connected_hosts().await, vec![id.clone()]);

        drop(session);
        f.transport.detach(&id, "").await;
        assert!(!f.controller.get_host(&id).await.unwrap().connected);
        assert!(matches!(
            f.controller.get_host("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn paused_host_refuses_dispatch_until_resumed() {
        let f = fixture().await;
        let (enrollment, session) = enroll(&f, "edge-1").await;
        let id = enrollment.host.id.clone();
        let agent = acking_agent(session);

        f.controller.pause_host(&id).await.unwrap();
        assert!(f.controller.get_host(&id).await.unwrap().connected);
        assert!(matches!(
            f.controller
                .remote_container_action(&id, "web", ContainerAction::Restart)
                .await,
            Err(Error::HostPaused(_))
        ));

        f.controller.resume_host(&id).await.unwrap();
        let ack = f
            .controller
            .update_remote_container(&id, "web", "nginx:1.26", "sha256:abc")
            .await
            .unwrap();
        assert!(!ack.request_id.is_empty());

        f.transport.detach(&id, "").await;
        let seen = agent.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            AgentCommand::UpdateContainer { name, target_image, .. }
                if name == "web" && target_image == "nginx:1.26"
        ));
    }

    #[tokio::test]
    async fn revoked_host_never_accepts_dispatch() {
        let f = fixture().await;
        let (enrollment, session) = enroll(&f, "edge-1").await;
        let id = enrollment.host.id.clone();
        let _agent = acking_agent(session);

        let revoked = f.controller.revoke_host(&id).await.unwrap();
        assert_eq!(revoked.state, HostState::Revoked);
        assert!(matches!(
            f.controller
                .remote_container_action(&id, "web", ContainerAction::Stop)
                .await,
            Err(Error::Forbidden(_))
        ));
        assert!(f.controller.pause_host(&id).await.is_err());
        assert!(f.controller.resume_host(&id).await.is_err());

        // The transport refuses the revoked credential from now on.
        assert!(f
            .transport
            .attach(&id, &enrollment.credential)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn dispatch_to_disconnected_host_fails() {
        let f = fixture().await;
        let (enrollment, session) = enroll(&f, "edge-1").await;
        let id = enrollment.host.id.clone();
        drop(session);
        f.transport.detach(&id, "").await;

        assert!(matches!(
            f.controller
                .remote_container_action(&id, "web", ContainerAction::Start)
                .await,
            Err(Error::HostNotConnected(_))
        ));
        assert!(matches!(
            f.controller
                .remote_container_action("unknown", "web", ContainerAction::Start)
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_host_deletes_record() {
        let f = fixture().await;
        let (enrollment, _session) = enroll(&f, "edge-1").await;
        let id = enrollment.host.id.clone();

        let removed = f.controller.remove_host(&id).await.unwrap();
        assert_eq!(removed.state, HostState::Decommissioned);
        assert!(f.controller.all_hosts().await.is_empty());
        assert!(matches!(
            f.controller.remove_host(&id).await,
            Err(Error::NotFound(_))
        ));
        // Heartbeats do not bring it back.
        assert!(f.controller.record_heartbeat(&id, "1.2.1", Vec::new()).await.is_err());
        assert!(f.controller.get_host(&id).await.is_err());
    }

    #[tokio::test]
    async fn inventories_are_host_qualified() {
        let f = fixture().await;
        let (enrollment, _session) = enroll(&f, "edge-1").await;
        let id = enrollment.host.id.clone();

        let reported = Entity {
            key: EntityKey::local("web"),
            id: "c1".into(),
            image: "nginx:1.24".into(),
            digest: Some("sha256:aaa".into()),
            entity_type: EntityType::Container,
            labels: HashMap::new(),
        };
        f.controller
            .record_heartbeat(&id, "1.3.0", vec![reported])
            .await
            .unwrap();

        let all = f.controller.all_host_containers().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, EntityKey::remote(id.clone(), "web"));
        let view = f.controller.get_host(&id).await.unwrap();
        assert_eq!(view.host.container_count, 1);
        assert_eq!(view.host.agent_version, "1.3.0");
    }

    #[tokio::test]
    async fn disconnect_is_recorded_on_host() {
        let f = fixture().await;
        let (enrollment, _session) = enroll(&f, "edge-1").await;
        let id = enrollment.host.id.clone();

        f.controller
            .record_disconnect(&id, "read tcp: i/o timeout")
            .await;
        let host = f.controller.get_host(&id).await.unwrap().host;
        let record = host.last_disconnect.unwrap();
        assert_eq!(record.category, DisconnectCategory::Timeout);
        assert_eq!(record.error, "read tcp: i/o timeout");

        // Unknown hosts are ignored.
        f.controller.record_disconnect("ghost", "eof").await;
    }

    #[tokio::test]
    async fn hosts_survive_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ledger = Arc::new(CredentialLedger::load(Arc::clone(&store)).await.unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let transport = Arc::new(ChannelTransport::new(ledger.clone(), tx, Duration::from_secs(1)));

        let id = {
            let controller = ClusterController::load(
                Arc::clone(&store),
                transport.clone(),
                ledger.clone(),
                ClusterSettings::default(),
            )
            .await
            .unwrap();
            let token = controller.generate_enroll_token().await.unwrap();
            let enrollment = controller
                .redeem_enrollment(&token.token, request("edge-1"))
                .await
                .unwrap();
            controller.pause_host(&enrollment.host.id).await.unwrap();
            enrollment.host.id
        };

        let controller =
            ClusterController::load(store, transport, ledger, ClusterSettings::default())
                .await
                .unwrap();
        let host = controller.get_host(&id).await.unwrap().host;
        assert_eq!(host.state, HostState::Paused);
        assert_eq!(controller.enrollment_tokens().await.len(), 1);
    }

    /// Rejects writes to the host bucket while `failing` is set.
    struct HostWritesFail {
        inner: MemoryStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl HostWritesFail {
        fn rejects(&self, bucket: &str) -> bool {
            bucket == BUCKET && self.failing.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn fail(&self, on: bool) {
            self.failing.store(on, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl KeyValueStore for HostWritesFail {
        async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(bucket, key).await
        }

        async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<()> {
            if self.rejects(bucket) {
                return Err(Error::storage(
                    "write",
                    key,
                    std::io::Error::new(std::io::ErrorKind::Other, "read-only filesystem"),
                ));
            }
            self.inner.put(bucket, key, value).await
        }

        async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
            if self.rejects(bucket) {
                return Err(Error::storage(
                    "delete",
                    key,
                    std::io::Error::new(std::io::ErrorKind::Other, "read-only filesystem"),
                ));
            }
            self.inner.delete(bucket, key).await
        }

        async fn list(&self, bucket: &str) -> Result<std::collections::BTreeMap<String, Vec<u8>>> {
            self.inner.list(bucket).await
        }
    }

    async fn controller_on(store: Arc<HostWritesFail>) -> ClusterController {
        let store: Arc<dyn KeyValueStore> = store;
        let ledger = Arc::new(CredentialLedger::load(Arc::clone(&store)).await.unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let transport = Arc::new(ChannelTransport::new(ledger.clone(), tx, Duration::from_secs(1)));
        ClusterController::load(store, transport, ledger, ClusterSettings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failed_enrollment_leaves_no_host_and_revokes_credential() {
        let store = Arc::new(HostWritesFail {
            inner: MemoryStore::new(),
            failing: Default::default(),
        });
        let controller = controller_on(Arc::clone(&store)).await;
        let token = controller.generate_enroll_token().await.unwrap();

        store.fail(true);
        assert!(matches!(
            controller.redeem_enrollment(&token.token, request("edge-1")).await,
            Err(Error::Storage { .. })
        ));
        assert!(controller.all_hosts().await.is_empty());

        let credentials = store.inner.list("credentials").await.unwrap();
        assert_eq!(credentials.len(), 1);
        for bytes in credentials.values() {
            let record: serde_json::Value = serde_json::from_slice(bytes).unwrap();
            assert!(record["revoked_at"].is_string());
        }
    }

    #[tokio::test]
    async fn failed_removal_keeps_host() {
        let store = Arc::new(HostWritesFail {
            inner: MemoryStore::new(),
            failing: Default::default(),
        });
        let controller = controller_on(Arc::clone(&store)).await;
        let token = controller.generate_enroll_token().await.unwrap();
        let id = controller
            .redeem_enrollment(&token.token, request("edge-1"))
            .await
            .unwrap()
            .host
            .id;

        store.fail(true);
        assert!(controller.remove_host(&id).await.is_err());
        assert_eq!(controller.get_host(&id).await.unwrap().host.state, HostState::Active);

        store.fail(false);
        controller.remove_host(&id).await.unwrap();
        let reloaded = controller_on(store).await;
        assert!(reloaded.all_hosts().await.is_empty());
    }
}
