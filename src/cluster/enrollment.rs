//! Single-use enrollment tokens.
//!
//! A token is 256 bits of OS entropy, hex encoded, returned to the operator
//! exactly once.  Only its SHA-256 is kept, next to a short non-secret id
//! that is safe to show in audit logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::random_hex;
use super::trust::fingerprint;
use crate::error::{Error, Result};
use crate::store::{decode, encode, KeyValueStore};

const BUCKET: &str = "tokens";

/// Consumed or expired tokens are kept this long for audit, then pruned.
const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentToken {
    pub id: String,
    secret_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub used_by: Option<String>,
}

impl EnrollmentToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Plaintext token as returned by generation. Never stored.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedToken {
    pub id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenLedger {
    store: Arc<dyn KeyValueStore>,
    tokens: Mutex<HashMap<String, EnrollmentToken>>,
    ttl: Duration,
}

impl TokenLedger {
    pub async fn load(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Result<Self> {
        let mut tokens = HashMap::new();
        for (id, bytes) in store.list(BUCKET).await? {
            let token: EnrollmentToken = decode("load token", &id, &bytes)?;
            tokens.insert(id, token);
        }
        Ok(Self {
            store,
            tokens: Mutex::new(tokens),
            ttl,
        })
    }

    pub async fn generate(&self) -> Result<GeneratedToken> {
        self.prune().await;

        let secret = random_hex(32);
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| Error::InvalidArgument(format!("token ttl: {}", e)))?;
        let token = EnrollmentToken {
            id: random_hex(6),
            secret_hash: fingerprint(&secret),
            created_at: now,
            expires_at: now + ttl,
            used_at: None,
            used_by: None,
        };

        let bytes = encode("write token", &token.id, &token)?;
        self.store.put(BUCKET, &token.id, bytes).await?;
        self.tokens.lock().await.insert(token.id.clone(), token.clone());

        info!("Generated enrollment token {} (expires {})", token.id, token.expires_at);
        Ok(GeneratedToken {
            id: token.id,
            token: secret,
            expires_at: token.expires_at,
        })
    }

    /// Consumes the token. Of concurrent redemptions only one succeeds.
    pub async fn redeem(&self, secret: &str, redeemer: &str) -> Result<EnrollmentToken> {
        let hash = fingerprint(secret.trim());
        let now = Utc::now();

        let consumed = {
            let mut tokens = self.tokens.lock().await;
            let token = tokens
                .values_mut()
                .find(|t| t.secret_hash == hash)
                .ok_or_else(|| Error::Token("unknown enrollment token".into()))?;
            if token.used_at.is_some() {
                return Err(Error::Token(format!("token {} already used", token.id)));
            }
            if token.is_expired(now) {
                return Err(Error::Token(format!("token {} expired", token.id)));
            }
            token.used_at = Some(now);
            token.used_by = Some(redeemer.to_string());
            token.clone()
        };

        // The in-memory mark above is what prevents a second admission; a
        // failed write only loses the audit trail.
        match encode("write token", &consumed.id, &consumed) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(BUCKET, &consumed.id, bytes).await {
                    warn!("Failed to persist consumption of token {}: {}", consumed.id, e);
                }
            }
            Err(e) => warn!("Failed to encode token {}: {}", consumed.id, e),
        }
        info!("Enrollment token {} redeemed by {}", consumed.id, redeemer);
        Ok(consumed)
    }

    /// Tokens for audit display, newest first.
    pub async fn list(&self) -> Vec<EnrollmentToken> {
        let mut out: Vec<EnrollmentToken> = self.tokens.lock().await.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    async fn prune(&self) {
        let cutoff = match chrono::Duration::from_std(RETENTION) {
            Ok(retention) => Utc::now() - retention,
            Err(_) => return,
        };
        let stale: Vec<String> = {
            let mut tokens = self.tokens.lock().await;
            let stale: Vec<String> = tokens
                .values()
                .filter(|t| t.used_at.unwrap_or(t.expires_at) < cutoff)
                .map(|t| t.id.clone())
                .collect();
            for id in &stale {
                tokens.remove(id);
            }
            stale
        };
        for id in stale {
            if let Err(e) = self.store.delete(BUCKET, &id).await {
                warn!("Failed to prune token {}: {}", id, e);
            }
        }
    }
}
