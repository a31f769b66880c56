//! Multi-entity policy changes with a dry-run preview.

use std::collections::{HashMap, HashSet};

use log::{info, warn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::policy::PolicyStore;
use crate::runtime::LabelSource;
use crate::types::{is_self_labelled, Entity, EntityKey, Policy};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyChange {
    pub name: String,
    pub from: Policy,
    pub to: Policy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Skipped {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkPlan {
    pub target: Option<Policy>,
    pub confirmed: bool,
    pub changes: Vec<PolicyChange>,
    pub blocked: Vec<Skipped>,
    pub unchanged: Vec<Skipped>,
    /// Entries that could not be resolved, plus changes that failed to
    /// persist when confirmed.
    pub failed: Vec<Skipped>,
    pub applied: usize,
}

pub struct BulkPolicyPlanner<'a> {
    store: &'a PolicyStore,
    labels: &'a dyn LabelSource,
}

impl<'a> BulkPolicyPlanner<'a> {
    pub fn new(store: &'a PolicyStore, labels: &'a dyn LabelSource) -> Self {
        Self { store, labels }
    }

    /// Builds the plan and, when `confirm` is set, applies every change.
    pub async fn run(&self, names: &[String], target: &str, confirm: bool) -> Result<BulkPlan> {
        if names.is_empty() {
            return Err(Error::InvalidArgument("no entities given".into()));
        }
        let target: Policy = target.parse()?;

        let mut plan = BulkPlan {
            target: Some(target),
            confirmed: confirm,
            ..Default::default()
        };
        let known: HashMap<String, Entity> = self
            .labels
            .entities()
            .await?
            .into_iter()
            .map(|e| (e.key.canonical(), e))
            .collect();
        let mut seen = HashSet::new();

        for name in names {
            let key = EntityKey::parse(name);
            let canonical = key.canonical();
            if !seen.insert(canonical.clone()) {
                continue;
            }
            let labels = match self.labels_for(&key, &known).await {
                Ok(labels) => labels,
                Err(e) => {
                    plan.failed.push(Skipped {
                        name: name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if is_self_labelled(&labels) {
                plan.blocked.push(Skipped {
                    name: name.clone(),
                    reason: "self-protected".into(),
                });
                continue;
            }
            let current = match self.store.resolve(&canonical, &labels).await {
                Ok(policy) => policy,
                Err(e) => {
                    warn!("Cannot resolve policy for {}: {}", name, e);
                    plan.failed.push(Skipped {
                        name: name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if current == target {
                plan.unchanged.push(Skipped {
                    name: name.clone(),
                    reason: format!("already {}", target),
                });
            } else {
                plan.changes.push(PolicyChange {
                    name: name.clone(),
                    from: current,
                    to: target,
                });
            }
        }

        if !confirm {
            return Ok(plan);
        }

        for change in &plan.changes {
            let key = EntityKey::parse(&change.name).canonical();
            match self.store.set_override(&key, change.to).await {
                Ok(()) => plan.applied += 1,
                Err(e) => {
                    warn!("Bulk policy change for {} failed: {}", change.name, e);
                    plan.failed.push(Skipped {
                        name: change.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            "Bulk policy {}: {} applied, {} failed, {} blocked, {} unchanged",
            target,
            plan.applied,
            plan.failed.len(),
            plan.blocked.len(),
            plan.unchanged.len()
        );
        Ok(plan)
    }

    // The fleet listing only covers connected hosts; remote keys missing
    // from it fall back to the last reported inventory.
    async fn labels_for(
        &self,
        key: &EntityKey,
        known: &HashMap<String, Entity>,
    ) -> Result<HashMap<String, String>> {
        if let Some(entity) = known.get(&key.canonical()) {
            return Ok(entity.labels.clone());
        }
        if !key.is_remote() {
            return Ok(HashMap::new());
        }
        Ok(self
            .labels
            .entity(key)
            .await?
            .map(|e| e.labels)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::types::{EntityType, POLICY_LABEL, SELF_LABEL};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct StaticLabels(Vec<Entity>);

    #[async_trait]
    impl LabelSource for StaticLabels {
        async fn entities(&self) -> Result<Vec<Entity>> {
            Ok(self.0.clone())
        }
    }

    fn entity(key: EntityKey, labels: &[(&str, &str)]) -> Entity {
        Entity {
            key,
            id: "id".into(),
            image: "img:1".into(),
            digest: None,
            entity_type: EntityType::Container,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn fleet() -> StaticLabels {
        StaticLabels(vec![
            entity(EntityKey::local("web"), &[(POLICY_LABEL, "manual")]),
            entity(EntityKey::local("db"), &[(POLICY_LABEL, "pinned")]),
            entity(EntityKey::local("sentinel"), &[(SELF_LABEL, "true")]),
            entity(EntityKey::remote("h1", "web"), &[]),
        ])
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn preview_mutates_nothing() {
        let store = PolicyStore::new(Arc::new(MemoryStore::new()));
        let labels = fleet();
        let planner = BulkPolicyPlanner::new(&store, &labels);

        let plan = planner
            .run(&names(&["web", "db", "sentinel", "h1::web"]), "pinned", false)
            .await
            .unwrap();
        assert_eq!(plan.changes.len(), 2);
        assert_eq!(plan.unchanged.len(), 1);
        assert_eq!(plan.blocked.len(), 1);
        assert_eq!(plan.applied, 0);
        assert!(store.all_overrides().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirm_applies_only_changes() {
        let store = PolicyStore::new(Arc::new(MemoryStore::new()));
        let labels = fleet();
        let planner = BulkPolicyPlanner::new(&store, &labels);

        let plan = planner
            .run(&names(&["web", "db", "sentinel", "h1::web", "ghost"]), "pinned", true)
            .await
            .unwrap();
        assert_eq!(plan.applied, 3);
        let all = store.all_overrides().await.unwrap();
        let keys: Vec<&str> = all.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ghost", "h1::web", "web"]);
        assert!(all.values().all(|p| *p == Policy::Pinned));
        assert_eq!(plan.blocked[0].name, "sentinel");
        assert_eq!(plan.unchanged[0].name, "db");
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let store = PolicyStore::new(Arc::new(MemoryStore::new()));
        let labels = fleet();
        let planner = BulkPolicyPlanner::new(&store, &labels);

        assert!(matches!(
            planner.run(&[], "auto", true).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            planner.run(&names(&["web"]), "sometimes", true).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    /// Fails writes for one key so partial application can be observed.
    struct FlakyStore {
        inner: MemoryStore,
        poisoned: String,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(bucket, key).await
        }

        async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<()> {
            if key == self.poisoned {
                return Err(Error::storage(
                    "write",
                    key,
                    std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                ));
            }
            self.inner.put(bucket, key, value).await
        }

        async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
            self.inner.delete(bucket, key).await
        }

        async fn list(&self, bucket: &str) -> Result<BTreeMap<String, Vec<u8>>> {
            self.inner.list(bucket).await
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_batch() {
        let store = PolicyStore::new(Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            poisoned: "web".into(),
        }));
        let labels = StaticLabels(Vec::new());
        let planner = BulkPolicyPlanner::new(&store, &labels);

        let plan = planner
            .run(&names(&["web", "api", "worker"]), "auto", true)
            .await
            .unwrap();
        assert_eq!(plan.applied, 2);
        assert_eq!(plan.failed.len(), 1);
        assert_eq!(plan.failed[0].name, "web");
    }

    #[tokio::test]
    async fn unreadable_override_fails_only_that_member() {
        let backend = Arc::new(MemoryStore::new());
        backend
            .put("overrides", "api", b"not json".to_vec())
            .await
            .unwrap();
        let store = PolicyStore::new(backend);
        let labels = StaticLabels(Vec::new());
        let planner = BulkPolicyPlanner::new(&store, &labels);

        let plan = planner
            .run(&names(&["web", "api", "worker"]), "auto", true)
            .await
            .unwrap();
        assert_eq!(plan.applied, 2);
        assert_eq!(plan.failed.len(), 1);
        assert_eq!(plan.failed[0].name, "api");
        assert_eq!(store.get_override("web").await.unwrap(), Some(Policy::Auto));
        assert_eq!(store.get_override("worker").await.unwrap(), Some(Policy::Auto));
    }

    /// Counts full listings; `entity` is left to the trait default.
    struct CountingLabels {
        inner: StaticLabels,
        listings: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LabelSource for CountingLabels {
        async fn entities(&self) -> Result<Vec<Entity>> {
            self.listings
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.entities().await
        }
    }

    #[tokio::test]
    async fn duplicates_collapse_and_fleet_is_listed_once() {
        let store = PolicyStore::new(Arc::new(MemoryStore::new()));
        let labels = CountingLabels {
            inner: fleet(),
            listings: Default::default(),
        };
        let planner = BulkPolicyPlanner::new(&store, &labels);

        let plan = planner
            .run(&names(&["web", "web", "db", "h1::web", "h1::web"]), "auto", true)
            .await
            .unwrap();
        assert_eq!(plan.changes.len(), 3);
        assert_eq!(plan.applied, 3);
        assert_eq!(labels.listings.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
