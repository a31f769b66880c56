//! Per-entity policy overrides and effective-policy resolution.
//!
//! Overrides are persisted under their canonical key, so remote entries
//! carry the same `host::name` qualification as the update queue.  When no
//! override exists the policy comes from the entity's `sentinel.policy`
//! label, and `manual` when that is missing or invalid.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::info;

use crate::error::{Error, Result};
use crate::store::{decode, encode, KeyValueStore};
use crate::types::{is_self_labelled, Policy};

const BUCKET: &str = "overrides";

#[derive(Clone)]
pub struct PolicyStore {
    backend: Option<Arc<dyn KeyValueStore>>,
}

impl PolicyStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A store with no backing persistence; every call fails ServiceUnavailable.
    pub fn unavailable() -> Self {
        Self { backend: None }
    }

    fn backend(&self) -> Result<&Arc<dyn KeyValueStore>> {
        self.backend
            .as_ref()
            .ok_or_else(|| Error::ServiceUnavailable("policy store has no backing store".into()))
    }

    pub async fn get_override(&self, key: &str) -> Result<Option<Policy>> {
        match self.backend()?.get(BUCKET, key).await? {
            Some(bytes) => Ok(Some(decode("read override", key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_override(&self, key: &str, policy: Policy) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty entity key".into()));
        }
        let bytes = encode("write override", key, &policy)?;
        self.backend()?.put(BUCKET, key, bytes).await?;
        info!("Policy override for {} set to {}", key, policy);
        Ok(())
    }

    pub async fn delete_override(&self, key: &str) -> Result<()> {
        if self.backend()?.delete(BUCKET, key).await? {
            info!("Policy override for {} removed", key);
            Ok(())
        } else {
            Err(Error::NotFound(format!("policy override {}", key)))
        }
    }

    pub async fn all_overrides(&self) -> Result<BTreeMap<String, Policy>> {
        let raw = self.backend()?.list(BUCKET).await?;
        let mut out = BTreeMap::new();
        for (key, bytes) in raw {
            let policy = decode("read override", &key, &bytes)?;
            out.insert(key, policy);
        }
        Ok(out)
    }

    /// Override if present, else the label default.
    pub async fn resolve(&self, key: &str, labels: &HashMap<String, String>) -> Result<Policy> {
        Ok(match self.get_override(key).await? {
            Some(policy) => policy,
            None => Policy::from_labels(labels),
        })
    }
}

/// Self-protection guard run first by every mutating entry point.
pub fn ensure_mutable(key: &str, labels: &HashMap<String, String>) -> Result<()> {
    if is_self_labelled(labels) {
        return Err(Error::Forbidden(format!(
            "{} is the managing instance and cannot be modified",
            key
        )));
    }
    Ok(())
}
