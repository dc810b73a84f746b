//! Keeps the in-memory policy set, the durable cache and the config store
//! in step.
//!
//! [`PolicySource::load`] performs the startup load (store first, cache as
//! fallback). [`PolicySource::watch`] is the long-running subscription
//! loop: it re-reads every changed key, applies strictly newer versions and
//! reconnects with a full reconciliation after the subscription is lost.
//! All writes to the [`PolicySet`] go through this type and are serialized
//! by `write_lock`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::cache::PolicyCache;
use super::model::{PolicyKey, RoutingPolicy};
use super::validation::validate_policy;
use super::{ApplyOutcome, ChangeEvent, PolicySet, PolicyStore};
use crate::error::RouterError;

/// Where the most recent full load was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadOrigin {
    Store,
    Cache,
}

impl std::fmt::Display for LoadOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Store => "store",
            Self::Cache => "cache",
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum StoreFault {
    #[error("no config store configured")]
    NotConfigured,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct PolicySourceSettings {
    pub watch_enabled: bool,
    /// Bound on every config store call.
    pub store_timeout: Duration,
    /// Pause before resubscribing after the subscription was lost.
    pub reconnect_delay: Duration,
}

impl Default for PolicySourceSettings {
    fn default() -> Self {
        Self {
            watch_enabled: true,
            store_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Counts from one reconciliation pass against a full store listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub applied: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub rejected: usize,
}

pub struct PolicySource {
    store: Option<Arc<dyn PolicyStore>>,
    cache: PolicyCache,
    policies: Arc<PolicySet>,
    settings: PolicySourceSettings,
    write_lock: Mutex<()>,
    origin: ArcSwapOption<LoadOrigin>,
}

impl PolicySource {
    #[must_use]
    pub fn new(
        store: Option<Arc<dyn PolicyStore>>,
        cache: PolicyCache,
        settings: PolicySourceSettings,
    ) -> Self {
        Self {
            store,
            cache,
            policies: Arc::new(PolicySet::new()),
            settings,
            write_lock: Mutex::new(()),
            origin: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn policies(&self) -> Arc<PolicySet> {
        Arc::clone(&self.policies)
    }

    #[must_use]
    pub fn origin(&self) -> Option<LoadOrigin> {
        self.origin.load().as_deref().copied()
    }

    #[must_use]
    pub fn store_name(&self) -> Option<&'static str> {
        self.store.as_ref().map(|s| s.name())
    }

    pub fn cache(&self) -> &PolicyCache {
        &self.cache
    }

    /// Initial load. The store wins when it answers with at least one
    /// policy; otherwise whatever the cache holds is served.
    pub async fn load(&self) -> Result<LoadOrigin, RouterError> {
        let _guard = self.write_lock.lock().await;

        if self.store.is_none() {
            tracing::debug!("no config store configured, loading policies from cache");
        } else {
            match self.list_from_store().await {
                Ok(listed) => {
                    let (valid, rejected) = accept_valid(listed);
                    if valid.is_empty() {
                        tracing::warn!(
                            rejected,
                            "config store returned no usable policies, falling back to cache"
                        );
                    } else {
                        if let Err(e) = self.cache.replace_all(&valid).await {
                            tracing::warn!(
                                error = %e,
                                "failed to persist loaded policies to cache"
                            );
                        }
                        tracing::info!(
                            policies = valid.len(),
                            rejected,
                            store = self.store_name().unwrap_or("none"),
                            "policies loaded from config store"
                        );
                        self.policies.replace_all(valid);
                        return Ok(self.set_origin(LoadOrigin::Store));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "config store unavailable, falling back to cache");
                }
            }
        }

        let (cached, rejected) = accept_valid(self.cache.load_all().await?);
        if cached.is_empty() {
            return Err(RouterError::NoPolicySources);
        }
        tracing::info!(policies = cached.len(), rejected, "policies loaded from cache");
        self.policies.replace_all(cached);
        Ok(self.set_origin(LoadOrigin::Cache))
    }

    /// Reconcile against a full store listing on demand.
    pub async fn refresh(&self) -> Result<ReconcileSummary, RouterError> {
        let _guard = self.write_lock.lock().await;
        let summary = self.reconcile().await?;
        self.set_origin(LoadOrigin::Store);
        Ok(summary)
    }

    /// Subscription loop; returns when `cancel` fires. Does nothing without
    /// a store or when watching is disabled.
    pub async fn watch(self: Arc<Self>, cancel: CancellationToken) {
        let Some(store) = self.store.clone() else {
            tracing::debug!("no config store configured, policy watch not started");
            return;
        };
        if !self.settings.watch_enabled {
            tracing::info!("policy watch disabled");
            return;
        }

        loop {
            let subscribed = tokio::select! {
                () = cancel.cancelled() => return,
                subscribed = store.subscribe() => subscribed,
            };

            match subscribed {
                Ok(mut events) => {
                    tracing::info!(store = store.name(), "subscribed to policy changes");
                    // Anything that changed while unsubscribed is picked up here.
                    match self.refresh().await {
                        Ok(summary) if summary != ReconcileSummary::default() => {
                            tracing::info!(?summary, "policies reconciled after subscribe");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "reconciliation after subscribe failed");
                        }
                    }

                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            event = events.recv() => match event {
                                Some(event) => self.handle_event(store.as_ref(), event).await,
                                None => break,
                            },
                        }
                    }
                    tracing::warn!(
                        store = store.name(),
                        retry_in = ?self.settings.reconnect_delay,
                        "policy subscription lost, serving last known policies"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in = ?self.settings.reconnect_delay,
                        "failed to subscribe to policy changes"
                    );
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
    }

    async fn handle_event(&self, store: &dyn PolicyStore, event: ChangeEvent) {
        let _guard = self.write_lock.lock().await;
        let key = event.key;

        let read = tokio::time::timeout(self.settings.store_timeout, store.get(&key)).await;
        match read {
            Ok(Ok(Some(policy))) => {
                if policy.key() != key {
                    tracing::warn!(
                        key = %key,
                        found = %policy.key(),
                        "policy stored under a foreign key, ignoring"
                    );
                    return;
                }
                if let Err(errors) = validate_policy(&policy) {
                    log_rejected(&policy, &errors);
                    return;
                }
                self.apply_and_persist(policy).await;
            }
            Ok(Ok(None)) => self.remove_and_persist(&key).await,
            Ok(Err(e)) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "re-read of changed policy failed, keeping current"
                );
            }
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    timeout = ?self.settings.store_timeout,
                    "re-read of changed policy timed out, keeping current"
                );
            }
        }
    }

    /// Caller holds `write_lock`.
    async fn reconcile(&self) -> Result<ReconcileSummary, RouterError> {
        let listed = self.list_from_store().await?;
        let mut summary = ReconcileSummary::default();
        if listed.is_empty() {
            tracing::warn!("config store listing is empty, keeping current policies");
            return Ok(summary);
        }

        let mut seen = HashSet::with_capacity(listed.len());
        for policy in listed {
            seen.insert(policy.key());
            if let Err(errors) = validate_policy(&policy) {
                log_rejected(&policy, &errors);
                summary.rejected += 1;
                continue;
            }
            match self.apply_and_persist(policy).await {
                ApplyOutcome::Applied { .. } => summary.applied += 1,
                ApplyOutcome::Stale { .. } => summary.unchanged += 1,
            }
        }

        let gone: Vec<PolicyKey> = self
            .policies
            .snapshot()
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in gone {
            self.remove_and_persist(&key).await;
            summary.removed += 1;
        }

        Ok(summary)
    }

    async fn apply_and_persist(&self, policy: RoutingPolicy) -> ApplyOutcome {
        let key = policy.key();
        let version = policy.version;
        let outcome = self.policies.apply(policy.clone());

        match outcome {
            ApplyOutcome::Applied { previous } => {
                tracing::info!(
                    organization_id = %key.organization_id,
                    model = %key.model,
                    version,
                    previous = ?previous,
                    "policy applied"
                );
                if let Err(e) = self.cache.put(&policy).await {
                    tracing::warn!(key = %key, error = %e, "failed to persist policy to cache");
                }
            }
            ApplyOutcome::Stale { current } => {
                tracing::debug!(key = %key, version, current, "stale policy update dropped");
            }
        }
        outcome
    }

    async fn remove_and_persist(&self, key: &PolicyKey) {
        if self.policies.remove(key) {
            tracing::info!(
                organization_id = %key.organization_id,
                model = %key.model,
                "policy removed"
            );
        }
        if let Err(e) = self.cache.remove(key).await {
            tracing::warn!(key = %key, error = %e, "failed to remove policy from cache");
        }
    }

    async fn list_from_store(&self) -> Result<Vec<RoutingPolicy>, RouterError> {
        let Some(store) = self.store.as_ref() else {
            return Err(RouterError::ConfigSourceUnavailable {
                store: "none",
                source: Box::new(StoreFault::NotConfigured),
            });
        };
        let timeout = self.settings.store_timeout;
        tokio::time::timeout(timeout, store.list())
            .await
            .map_err(|_| RouterError::ConfigSourceUnavailable {
                store: store.name(),
                source: Box::new(StoreFault::Timeout(timeout)),
            })?
    }

    fn set_origin(&self, origin: LoadOrigin) -> LoadOrigin {
        self.origin.store(Some(Arc::new(origin)));
        origin
    }
}

fn accept_valid(policies: Vec<RoutingPolicy>) -> (Vec<RoutingPolicy>, usize) {
    let total = policies.len();
    let valid: Vec<RoutingPolicy> = policies
        .into_iter()
        .filter(|p| match validate_policy(p) {
            Ok(()) => true,
            Err(errors) => {
                log_rejected(p, &errors);
                false
            }
        })
        .collect();
    let rejected = total - valid.len();
    (valid, rejected)
}

fn log_rejected(policy: &RoutingPolicy, errors: &[crate::error::ValidationError]) {
    let reasons: Vec<String> = errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect();
    tracing::warn!(
        key = %policy.key(),
        version = policy.version,
        reasons = ?reasons,
        "invalid policy rejected"
    );
}
