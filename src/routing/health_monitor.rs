//! Backend health state machine.
//!
//! One entry per backend id, created lazily. Active probes and live
//! dispatch outcomes feed the same consecutive-failure counter: reaching
//! the threshold marks the backend unhealthy, any success resets it. An
//! operator can also hold a backend out of rotation; only an operator
//! releases the hold, whatever the health checks report. The whole map is
//! swapped atomically on every update so readers on the request path
//! never lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::backend_client::BackendTransport;
use crate::policy::model::BackendWeight;
use crate::registry::BackendRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Where a health observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Probe,
    Dispatch,
}

impl Observation {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Dispatch => "dispatch",
        }
    }
}

/// Set through the admin API; keeps a backend out of rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorHold {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_change: Option<DateTime<Utc>>,
    pub last_observed: Option<DateTime<Utc>>,
    pub hold: Option<OperatorHold>,
}

impl BackendHealth {
    fn routable(&self) -> bool {
        self.hold.is_none() && self.state == HealthState::Healthy
    }
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_error: None,
            last_change: None,
            last_observed: None,
            hold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealthView {
    pub backend_id: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_change: Option<DateTime<Utc>>,
    pub last_observed: Option<DateTime<Utc>>,
    /// False while unhealthy or held out by an operator.
    pub routable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold: Option<OperatorHold>,
}

type HealthMap = HashMap<String, BackendHealth>;

pub struct HealthMonitor {
    states: ArcSwap<HealthMap>,
    unhealthy_threshold: u32,
    write_lock: Mutex<()>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            states: ArcSwap::from_pointee(HealthMap::new()),
            unhealthy_threshold: unhealthy_threshold.max(1),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn unhealthy_threshold(&self) -> u32 {
        self.unhealthy_threshold
    }

    /// Backends never observed are healthy. Held backends are not.
    #[must_use]
    pub fn is_healthy(&self, backend_id: &str) -> bool {
        self.states
            .load()
            .get(backend_id)
            .map_or(true, BackendHealth::routable)
    }

    #[must_use]
    pub fn state(&self, backend_id: &str) -> Option<BackendHealth> {
        self.states.load().get(backend_id).cloned()
    }

    /// The routable subset of `backends`, in order.
    ///
    /// Ids in `degraded` (the policy's own list) go first; if that empties
    /// the list every backend is put back. Operator holds are then always
    /// honored. Finally unhealthy backends are dropped, unless none would
    /// remain, in which case the held-back remainder is returned so traffic
    /// is not refused on health alone.
    #[must_use]
    pub fn candidates(
        &self,
        backends: &[BackendWeight],
        degraded: &[String],
    ) -> Vec<BackendWeight> {
        let states = self.states.load();

        let mut pool: Vec<BackendWeight> = backends
            .iter()
            .filter(|b| !degraded.contains(&b.backend_id))
            .cloned()
            .collect();
        if pool.is_empty() && !backends.is_empty() {
            tracing::warn!(
                backends = backends.len(),
                "every backend is degraded by policy, using all of them"
            );
            pool = backends.to_vec();
        }

        pool.retain(|b| states.get(&b.backend_id).map_or(true, |h| h.hold.is_none()));

        let healthy: Vec<BackendWeight> = pool
            .iter()
            .filter(|b| {
                states
                    .get(&b.backend_id)
                    .map_or(true, |h| h.state == HealthState::Healthy)
            })
            .cloned()
            .collect();

        if healthy.is_empty() && !pool.is_empty() {
            tracing::warn!(
                backends = pool.len(),
                "no healthy candidates, falling back to every backend not held out"
            );
            return pool;
        }
        healthy
    }

    /// Take `backend_id` out of rotation until [`release`](Self::release).
    pub fn hold(&self, backend_id: &str, reason: Option<String>) {
        self.update(backend_id, |health, now| {
            tracing::warn!(
                backend_id,
                reason = reason.as_deref().unwrap_or("-"),
                "backend held out by operator"
            );
            health.hold = Some(OperatorHold { reason, since: now });
            health.last_change = Some(now);
        });
    }

    /// Clear an operator hold and reset the failure history. Returns whether
    /// a hold was in place.
    pub fn release(&self, backend_id: &str) -> bool {
        let mut held = false;
        self.update(backend_id, |health, now| {
            held = health.hold.take().is_some();
            health.state = HealthState::Healthy;
            health.consecutive_failures = 0;
            health.last_change = Some(now);
            tracing::info!(backend_id, held, "backend marked healthy by operator");
        });
        held
    }

    pub fn report_success(&self, backend_id: &str, source: Observation) {
        self.update(backend_id, |health, now| {
            health.consecutive_failures = 0;
            health.last_observed = Some(now);
            if health.state == HealthState::Unhealthy {
                health.state = HealthState::Healthy;
                health.last_change = Some(now);
                tracing::info!(
                    backend_id,
                    source = source.as_str(),
                    "backend recovered"
                );
            }
        });
    }

    pub fn report_failure(&self, backend_id: &str, reason: &str, source: Observation) {
        let threshold = self.unhealthy_threshold;
        self.update(backend_id, |health, now| {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_error = Some(reason.to_string());
            health.last_observed = Some(now);
            if health.state == HealthState::Healthy && health.consecutive_failures >= threshold {
                health.state = HealthState::Unhealthy;
                health.last_change = Some(now);
                tracing::warn!(
                    backend_id,
                    source = source.as_str(),
                    consecutive_failures = health.consecutive_failures,
                    error = reason,
                    "backend marked unhealthy"
                );
            }
        });
    }

    fn update(&self, backend_id: &str, apply: impl FnOnce(&mut BackendHealth, DateTime<Utc>)) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = HealthMap::clone(&self.states.load());
        apply(next.entry(backend_id.to_string()).or_default(), Utc::now());
        self.states.store(Arc::new(next));
    }

    /// Every backend in `registry` plus any other observed id, by id.
    #[must_use]
    pub fn snapshot(&self, registry: &BackendRegistry) -> Vec<BackendHealthView> {
        let states = self.states.load();
        let mut ids: Vec<String> = registry.list().iter().map(|e| e.id.clone()).collect();
        ids.extend(states.keys().filter(|k| registry.get(k).is_none()).cloned());
        ids.sort();

        ids.into_iter()
            .map(|id| {
                let health = states.get(&id).cloned().unwrap_or_default();
                BackendHealthView {
                    backend_id: id,
                    routable: health.routable(),
                    state: health.state,
                    consecutive_failures: health.consecutive_failures,
                    last_error: health.last_error,
                    last_change: health.last_change,
                    last_observed: health.last_observed,
                    hold: health.hold,
                }
            })
            .collect()
    }

    /// One backend's view; `None` when it is neither registered nor observed.
    #[must_use]
    pub fn view(&self, backend_id: &str, registry: &BackendRegistry) -> Option<BackendHealthView> {
        self.snapshot(registry)
            .into_iter()
            .find(|v| v.backend_id == backend_id)
    }

    /// Probe every registered backend concurrently and record the results.
    pub async fn probe_all(
        &self,
        registry: &BackendRegistry,
        transport: &Arc<dyn BackendTransport>,
        max_timeout: Duration,
    ) {
        let mut probes = JoinSet::new();
        for endpoint in registry.list() {
            let transport = Arc::clone(transport);
            let timeout = endpoint.timeout.min(max_timeout);
            probes.spawn(async move {
                let result = transport.probe(&endpoint, timeout).await;
                (endpoint.id.clone(), result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((id, Ok(()))) => self.report_success(&id, Observation::Probe),
                Ok((id, Err(e))) => {
                    tracing::debug!(backend_id = %id, error = %e, "health probe failed");
                    self.report_failure(&id, &e.to_string(), Observation::Probe);
                }
                Err(e) => tracing::error!(error = %e, "health probe task failed"),
            }
        }
    }

    /// Probe loop; returns when `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<BackendRegistry>,
        transport: Arc<dyn BackendTransport>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("health monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = self.probe_all(&registry, &transport, interval) => {}
            }
        }
    }
}
