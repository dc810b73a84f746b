//! Routing policy distribution: model, stores, durable cache, live set.
//!
//! Defines the [`PolicyStore`] trait for pluggable config stores, the
//! [`PolicySet`] holding the current in-memory policies, and the
//! [`ChangeEvent`] emitted by store subscriptions. Submodules provide the
//! data model, validation, the SQLite-backed [`cache::PolicyCache`], the
//! store implementations and the [`source::PolicySource`] that keeps all
//! of them in step.

pub mod cache;
pub mod model;
pub mod source;
pub mod stores;
pub mod validation;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RouterError;
use model::{PolicyKey, RoutingPolicy};

/// A key changed at the source of truth; the value must be re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: PolicyKey,
}

// async_trait is required here because PolicyStore is used as Arc<dyn PolicyStore>.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every policy currently stored. Connectivity problems are reported as
    /// [`RouterError::ConfigSourceUnavailable`].
    async fn list(&self) -> Result<Vec<RoutingPolicy>, RouterError>;

    /// A single policy; `Ok(None)` means the key does not exist.
    async fn get(&self, key: &PolicyKey) -> Result<Option<RoutingPolicy>, RouterError>;

    /// Change notifications. The receiver closing means the subscription
    /// was lost and must be re-established.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChangeEvent>, RouterError>;
}

pub type PolicyMap = HashMap<PolicyKey, Arc<RoutingPolicy>>;

/// Result of offering a policy to the [`PolicySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Newer than what was held (or the key was new).
    Applied { previous: Option<u64> },
    /// Same or lower version than the current one; ignored.
    Stale { current: u64 },
}

/// The current policies, replaced as a whole on every write.
///
/// Readers get a consistent snapshot without locking. Writes go through
/// [`source::PolicySource`], which serializes them.
#[derive(Debug, Default)]
pub struct PolicySet {
    current: ArcSwap<PolicyMap>,
}

impl PolicySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact lookup; the global fallback is the dispatcher's concern.
    #[must_use]
    pub fn get(&self, organization_id: &str, model: &str) -> Option<Arc<RoutingPolicy>> {
        self.current
            .load()
            .get(&PolicyKey::new(organization_id, model))
            .cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicyMap> {
        self.current.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    pub(crate) fn replace_all(&self, policies: Vec<RoutingPolicy>) {
        let map: PolicyMap = policies
            .into_iter()
            .map(|p| (p.key(), Arc::new(p)))
            .collect();
        self.current.store(Arc::new(map));
    }

    pub(crate) fn apply(&self, policy: RoutingPolicy) -> ApplyOutcome {
        let current = self.current.load_full();
        let key = policy.key();
        let previous = current.get(&key).map(|p| p.version);

        if let Some(version) = previous {
            if policy.version <= version {
                return ApplyOutcome::Stale { current: version };
            }
        }

        let mut next = (*current).clone();
        next.insert(key, Arc::new(policy));
        self.current.store(Arc::new(next));
        ApplyOutcome::Applied { previous }
    }

    pub(crate) fn remove(&self, key: &PolicyKey) -> bool {
        let current = self.current.load_full();
        if !current.contains_key(key) {
            return false;
        }
        let mut next = (*current).clone();
        next.remove(key);
        self.current.store(Arc::new(next));
        true
    }
}
