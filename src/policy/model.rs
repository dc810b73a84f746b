//! Serde data structures for routing policies.
//!
//! A [`RoutingPolicy`] is the unit of routing configuration for one
//! `(organization, model)` pair. Policies arrive as JSON from the config
//! store and as YAML/JSON from seed files ([`PolicyFile`]); the same
//! structures are persisted verbatim in the policy cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Organization id of the global/default policy for a model.
pub const GLOBAL_ORGANIZATION: &str = "*";

const fn default_failover_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub organization_id: String,

    pub model: String,

    /// Ordered candidates; weights are relative probability mass.
    pub backends: Vec<BackendWeight>,

    /// Maximum number of distinct backends one request may try.
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,

    /// Backends taken out of rotation by the policy owner. Skipped before
    /// health filtering unless that would leave nothing to route to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_backends: Vec<String>,

    pub version: u64,

    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl RoutingPolicy {
    #[must_use]
    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(&self.organization_id, &self.model)
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.organization_id == GLOBAL_ORGANIZATION
    }

    #[must_use]
    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.backend_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendWeight {
    pub backend_id: String,
    pub weight: u32,
}

/// Identity of a policy: one policy per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub organization_id: String,
    pub model: String,
}

impl PolicyKey {
    #[must_use]
    pub fn new(organization_id: &str, model: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            model: model.to_string(),
        }
    }

    #[must_use]
    pub fn global(model: &str) -> Self {
        Self::new(GLOBAL_ORGANIZATION, model)
    }

    /// Key used by the on-disk cache table: `{org}:{model}`.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.organization_id, self.model)
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization_id, self.model)
    }
}

/// Root of a policy seed file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<RoutingPolicy>,
}

impl PolicyFile {
    #[must_use]
    pub fn total_backends(&self) -> usize {
        self.policies.iter().map(|p| p.backends.len()).sum()
    }
}
