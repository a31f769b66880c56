//! Agent transport.
//!
//! [`ChannelTransport`] owns the live connection set.  The network listener
//! that terminates agent connections attaches one [`AgentSession`] per
//! authenticated agent and forwards what the agent reports; the controller
//! only reads the connection set and sends commands through it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;

use super::trust::{HostCredential, TrustAuthority};
use crate::error::{Error, Result};
use crate::types::{ContainerAction, Entity};

/// Commands buffered per session; dispatch fails once the backlog is full.
const SESSION_BUFFER: usize = 32;

/// Command sent to a remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    UpdateContainer {
        request_id: String,
        name: String,
        target_image: String,
        target_digest: String,
    },
    ContainerAction {
        request_id: String,
        name: String,
        action: ContainerAction,
    },
}

impl AgentCommand {
    pub fn request_id(&self) -> &str {
        match self {
            AgentCommand::UpdateContainer { request_id, .. }
            | AgentCommand::ContainerAction { request_id, .. } => request_id,
        }
    }
}

/// Receipt returned by the agent before it starts working on a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAck {
    pub request_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Connection-layer events consumed by the controller.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected {
        host_id: String,
    },
    /// Periodic agent report with its full inventory.
    Heartbeat {
        host_id: String,
        agent_version: String,
        containers: Vec<Entity>,
    },
    /// Completion of a previously acknowledged command.
    ActionResult {
        host_id: String,
        request_id: String,
        error: Option<String>,
    },
    Disconnected {
        host_id: String,
        error: String,
    },
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Hosts with a live session.
    async fn connected(&self) -> HashSet<String>;

    /// Sends a command and waits for the agent's acknowledgement.
    async fn dispatch(&self, host_id: &str, command: AgentCommand) -> Result<DispatchAck>;
}

/// A command paired with its acknowledgement channel.
pub struct Envelope {
    pub command: AgentCommand,
    ack: oneshot::Sender<DispatchAck>,
}

impl Envelope {
    /// Acknowledges receipt; the command then runs on the agent's own schedule.
    pub fn acknowledge(self) -> AgentCommand {
        let ack = DispatchAck {
            request_id: self.command.request_id().to_string(),
            accepted_at: Utc::now(),
        };
        let _ = self.ack.send(ack);
        self.command
    }
}

/// Listener-side end of an attached agent connection.
pub struct AgentSession {
    pub host_id: String,
    commands: mpsc::Receiver<Envelope>,
}

impl AgentSession {
    pub async fn next_command(&mut self) -> Option<Envelope> {
        self.commands.recv().await
    }
}

pub struct ChannelTransport {
    sessions: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
    authority: Arc<dyn TrustAuthority>,
    events: mpsc::Sender<TransportEvent>,
    ack_timeout: Duration,
}

impl ChannelTransport {
    pub fn new(
        authority: Arc<dyn TrustAuthority>,
        events: mpsc::Sender<TransportEvent>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            authority,
            events,
            ack_timeout,
        }
    }

    /// Authenticates an agent and registers its session, replacing any older one.
    pub async fn attach(&self, host_id: &str, credential: &HostCredential) -> Result<AgentSession> {
        self.authority.verify(host_id, credential).await?;

        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let replaced = self
            .sessions
            .write()
            .await
            .insert(host_id.to_string(), tx)
            .is_some();
        if replaced {
            debug!("Replaced existing session for host {}", host_id);
        }
        info!("Agent {} connected", host_id);
        self.emit(TransportEvent::Connected {
            host_id: host_id.to_string(),
        });
        Ok(AgentSession {
            host_id: host_id.to_string(),
            commands: rx,
        })
    }

    /// Drops the session; `error` is empty for a clean shutdown.
    pub async fn detach(&self, host_id: &str, error: &str) {
        if self.sessions.write().await.remove(host_id).is_none() {
            return;
        }
        if error.is_empty() {
            info!("Agent {} disconnected", host_id);
        } else {
            warn!("Agent {} disconnected: {}", host_id, error);
        }
        self.emit(TransportEvent::Disconnected {
            host_id: host_id.to_string(),
            error: error.to_string(),
        });
    }

    pub fn report_heartbeat(&self, host_id: &str, agent_version: &str, containers: Vec<Entity>) {
        self.emit(TransportEvent::Heartbeat {
            host_id: host_id.to_string(),
            agent_version: agent_version.to_string(),
            containers,
        });
    }

    pub fn report_result(&self, host_id: &str, request_id: &str, error: Option<String>) {
        self.emit(TransportEvent::ActionResult {
            host_id: host_id.to_string(),
            request_id: request_id.to_string(),
            error,
        });
    }

    /// Removes a session whose agent end went away without a detach.
    async fn drop_closed(&self, host_id: &str) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(host_id) {
                Some(tx) if tx.is_closed() => sessions.remove(host_id).is_some(),
                _ => false,
            }
        };
        if removed {
            warn!("Agent {} session closed without detach", host_id);
            self.emit(TransportEvent::Disconnected {
                host_id: host_id.to_string(),
                error: "session closed".to_string(),
            });
        }
    }

    // Events are best-effort: a full channel never blocks the connection path.
    fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropped transport event: {}", e);
        }
    }
}

#[async_trait]
impl AgentTransport for ChannelTransport {
    async fn connected(&self) -> HashSet<String> {
        let stale: Vec<String> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, tx)| tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for host_id in stale {
            self.drop_closed(&host_id).await;
        }
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Fails fast when the session backlog is full; otherwise waits up to
    /// the ack timeout for the agent to acknowledge.
    async fn dispatch(&self, host_id: &str, command: AgentCommand) -> Result<DispatchAck> {
        let tx = self
            .sessions
            .read()
            .await
            .get(host_id)
            .cloned()
            .ok_or_else(|| Error::HostNotConnected(host_id.to_string()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let envelope = Envelope {
            command,
            ack: ack_tx,
        };
        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(Error::transport(host_id, "session backlog full"));
            }
            Err(TrySendError::Closed(_)) => {
                self.drop_closed(host_id).await;
                return Err(Error::transport(host_id, "session closed"));
            }
        }

        match timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(Error::transport(host_id, "agent dropped the command")),
            Err(_) => Err(Error::transport(host_id, "timed out waiting for acknowledgement")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::trust::CredentialLedger;
    use crate::store::MemoryStore;

    async fn transport() -> (ChannelTransport, Arc<CredentialLedger>, mpsc::Receiver<TransportEvent>) {
        let ledger = Arc::new(CredentialLedger::load(Arc::new(MemoryStore::new())).await.unwrap());
        let (tx, rx) = mpsc::channel(16);
        let transport = ChannelTransport::new(ledger.clone(), tx, Duration::from_secs(1));
        (transport, ledger, rx)
    }

    fn restart(request_id: &str) -> AgentCommand {
        AgentCommand::ContainerAction {
            request_id: request_id.into(),
            name: "web".into(),
            action: ContainerAction::Restart,
        }
    }

    #[tokio::test]
    async fn dispatch_returns_agent_ack() {
        let (transport, ledger, mut events) = transport().await;
        let cred = ledger.issue("h1").await.unwrap();
        let mut session = transport.attach("h1", &cred).await.unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Connected { .. })));
        assert!(transport.connected().await.contains("h1"));

        let agent = tokio::spawn(async move {
            let envelope = session.next_command().await.unwrap();
            envelope.acknowledge()
        });
        let ack = transport.dispatch("h1", restart("r1")).await.unwrap();
        assert_eq!(ack.request_id, "r1");
        assert_eq!(agent.await.unwrap(), restart("r1"));
    }

    #[tokio::test]
    async fn revoked_credential_cannot_attach() {
        let (transport, ledger, _events) = transport().await;
        let cred = ledger.issue("h1").await.unwrap();
        ledger.revoke(&cred.serial).await.unwrap();
        assert!(matches!(
            transport.attach("h1", &cred).await,
            Err(Error::Forbidden(_))
        ));
        assert!(transport.connected().await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_to_absent_host_fails() {
        let (transport, _ledger, _events) = transport().await;
        assert!(matches!(
            transport.dispatch("h9", restart("r1")).await,
            Err(Error::HostNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn dropped_command_is_a_transport_error() {
        let (transport, ledger, mut events) = transport().await;
        let cred = ledger.issue("h1").await.unwrap();
        let mut session = transport.attach("h1", &cred).await.unwrap();

        tokio::spawn(async move {
            drop(session.next_command().await);
        });
        assert!(matches!(
            transport.dispatch("h1", restart("r1")).await,
            Err(Error::Transport { .. })
        ));

        transport.detach("h1", "connection reset by peer").await;
        let _connected = events.recv().await;
        match events.recv().await {
            Some(TransportEvent::Disconnected { host_id, error }) => {
                assert_eq!(host_id, "h1");
                assert_eq!(error, "connection reset by peer");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_agent_fails_dispatch_instead_of_blocking() {
        let (transport, ledger, _events) = transport().await;
        let cred = ledger.issue("h1").await.unwrap();
        // Attached but never reads.
        let _session = transport.attach("h1", &cred).await.unwrap();

        for i in 0..SESSION_BUFFER {
            assert!(matches!(
                transport.dispatch("h1", restart(&format!("r{}", i))).await,
                Err(Error::Transport { .. })
            ));
        }
        let overflow = timeout(
            Duration::from_secs(3600),
            transport.dispatch("h1", restart("overflow")),
        )
        .await
        .expect("dispatch must not block on a full session");
        assert!(matches!(overflow, Err(Error::Transport { .. })));
    }

    #[tokio::test]
    async fn vanished_session_reports_disconnect() {
        let (transport, ledger, mut events) = transport().await;
        let cred = ledger.issue("h1").await.unwrap();
        let session = transport.attach("h1", &cred).await.unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Connected { .. })));

        drop(session);
        assert!(transport.connected().await.is_empty());
        match events.recv().await {
            Some(TransportEvent::Disconnected { host_id, error }) => {
                assert_eq!(host_id, "h1");
                assert_eq!(error, "session closed");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            transport.dispatch("h1", restart("r1")).await,
            Err(Error::HostNotConnected(_))
        ));
    }
}
