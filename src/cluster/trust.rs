//! Host trust credentials.
//!
//! Every enrolled host holds a credential: a serial plus a secret whose
//! SHA-256 fingerprint is pinned here.  The transport refuses sessions whose
//! credential is unknown, belongs to another host, or has been revoked.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::random_hex;
use crate::error::{Error, Result};
use crate::store::{decode, encode, KeyValueStore};

const BUCKET: &str = "credentials";

/// Credential handed to an agent once, at enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCredential {
    pub serial: String,
    pub secret: String,
}

impl HostCredential {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.secret)
    }
}

/// The non-secret part of a credential kept on the host record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub serial: String,
    pub fingerprint: String,
}

pub fn fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[async_trait]
pub trait TrustAuthority: Send + Sync {
    async fn issue(&self, host_id: &str) -> Result<HostCredential>;

    async fn revoke(&self, serial: &str) -> Result<()>;

    /// Fails Forbidden unless the credential was issued to `host_id` and is live.
    async fn verify(&self, host_id: &str, credential: &HostCredential) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssuedCredential {
    serial: String,
    host_id: String,
    fingerprint: String,
    issued_at: DateTime<Utc>,
    #[serde(default)]
    revoked_at: Option<DateTime<Utc>>,
}

/// [`TrustAuthority`] backed by the key-value store.
pub struct CredentialLedger {
    store: Arc<dyn KeyValueStore>,
    issued: RwLock<HashMap<String, IssuedCredential>>,
}

impl CredentialLedger {
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let mut issued = HashMap::new();
        for (serial, bytes) in store.list(BUCKET).await? {
            let record: IssuedCredential = decode("load credential", &serial, &bytes)?;
            issued.insert(serial, record);
        }
        Ok(Self {
            store,
            issued: RwLock::new(issued),
        })
    }

    async fn persist(&self, record: &IssuedCredential) -> Result<()> {
        let bytes = encode("write credential", &record.serial, record)?;
        self.store.put(BUCKET, &record.serial, bytes).await
    }
}

#[async_trait]
impl TrustAuthority for CredentialLedger {
    async fn issue(&self, host_id: &str) -> Result<HostCredential> {
        let credential = HostCredential {
            serial: random_hex(16),
            secret: random_hex(32),
        };
        let record = IssuedCredential {
            serial: credential.serial.clone(),
            host_id: host_id.to_string(),
            fingerprint: credential.fingerprint(),
            issued_at: Utc::now(),
            revoked_at: None,
        };
        self.persist(&record).await?;
        self.issued
            .write()
            .await
            .insert(record.serial.clone(), record);
        info!("Issued credential {} for host {}", credential.serial, host_id);
        Ok(credential)
    }

    async fn revoke(&self, serial: &str) -> Result<()> {
        let record = {
            let mut issued = self.issued.write().await;
            let record = issued
                .get_mut(serial)
                .ok_or_else(|| Error::NotFound(format!("credential {}", serial)))?;
            if record.revoked_at.is_none() {
                record.revoked_at = Some(Utc::now());
            }
            record.clone()
        };
        self.persist(&record).await?;
        info!("Revoked credential {} of host {}", serial, record.host_id);
        Ok(())
    }

    async fn verify(&self, host_id: &str, credential: &HostCredential) -> Result<()> {
        let issued = self.issued.read().await;
        let live = issued.get(&credential.serial).is_some_and(|r| {
            r.host_id == host_id
                && r.revoked_at.is_none()
                && r.fingerprint == credential.fingerprint()
        });
        if live {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "credential {} rejected for host {}",
                credential.serial, host_id
            )))
        }
    }
}
