//! Request dispatch: admission, policy resolution, weighted selection and
//! bounded failover.
//!
//! [`Dispatcher::dispatch`] runs the steps strictly in order and writes
//! exactly one usage record per call, whatever the outcome, and keeps the
//! most recent routing decisions in a bounded log. Policy and registry
//! state are only read here.

pub mod backend_client;
pub mod decisions;
pub mod health_monitor;
pub mod selection;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use hyper::header::HeaderValue;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::error::{AttemptFailure, DispatchError};
use crate::policy::model::{BackendWeight, RoutingPolicy, GLOBAL_ORGANIZATION};
use crate::policy::PolicySet;
use crate::registry::{saturating_millis, BackendRegistry};
use crate::usage::buffer::UsageBuffer;
use crate::usage::{estimate_cost, token_cost, UsageRecord, UsageStatus};
use backend_client::{BackendReply, BackendRequest, BackendTransport, TokenUsage};
use decisions::{DecisionLog, RoutingDecision};
use health_monitor::{HealthMonitor, Observation};
use selection::WeightedDraw;

/// One inbound request, already authenticated upstream.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request_id: String,
    pub organization_id: String,
    pub api_key_id: Option<String>,
    pub model: String,
    pub content_type: Option<HeaderValue>,
    pub payload: Bytes,
}

impl DispatchRequest {
    #[must_use]
    pub fn new(organization_id: &str, model: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            api_key_id: None,
            model: model.to_string(),
            content_type: None,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub request_id: String,
    pub backend_id: String,
    /// Organization of the policy that served the request (`*` for global).
    pub policy_organization: String,
    pub reply: BackendReply,
    /// Attempts that failed before the successful one.
    pub failed_attempts: Vec<AttemptFailure>,
}

#[derive(Debug, Default)]
struct AttemptTrace {
    attempts: u32,
    last_backend: Option<String>,
}

pub struct Dispatcher {
    policies: Arc<PolicySet>,
    registry: Arc<BackendRegistry>,
    health: Arc<HealthMonitor>,
    admission: Arc<AdmissionController>,
    transport: Arc<dyn BackendTransport>,
    usage: Arc<UsageBuffer>,
    cost_per_1k_tokens: f64,
    decisions: DecisionLog,
    rng: Mutex<StdRng>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        policies: Arc<PolicySet>,
        registry: Arc<BackendRegistry>,
        health: Arc<HealthMonitor>,
        admission: Arc<AdmissionController>,
        transport: Arc<dyn BackendTransport>,
        usage: Arc<UsageBuffer>,
        cost_per_1k_tokens: f64,
    ) -> Self {
        Self {
            policies,
            registry,
            health,
            admission,
            transport,
            usage,
            cost_per_1k_tokens,
            decisions: DecisionLog::default(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic selection, for tests and replays.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Recent routing decisions, oldest first.
    #[must_use]
    pub const fn decisions(&self) -> &DecisionLog {
        &self.decisions
    }

    /// The organization's policy for `model`, else the global one.
    pub fn resolve(
        &self,
        organization_id: &str,
        model: &str,
    ) -> Result<Arc<RoutingPolicy>, DispatchError> {
        self.policies
            .get(organization_id, model)
            .or_else(|| self.policies.get(GLOBAL_ORGANIZATION, model))
            .ok_or_else(|| DispatchError::NoRoutingPolicy {
                organization_id: organization_id.to_string(),
                model: model.to_string(),
            })
    }

    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let estimated_cost = estimate_cost(&request.payload, self.cost_per_1k_tokens);
        let mut trace = AttemptTrace::default();

        let result = self.route(request, estimated_cost, cancel, &mut trace).await;
        let latency_ms = saturating_millis(started.elapsed());

        match &result {
            Ok(outcome) => tracing::info!(
                request_id = %request.request_id,
                organization_id = %request.organization_id,
                model = %request.model,
                backend_id = %outcome.backend_id,
                attempts = trace.attempts,
                latency_ms,
                "request dispatched"
            ),
            Err(e) => tracing::warn!(
                request_id = %request.request_id,
                organization_id = %request.organization_id,
                model = %request.model,
                stage = %e.stage(),
                code = e.code(),
                attempts = trace.attempts,
                error = %e,
                "request failed"
            ),
        }

        self.decisions.push(RoutingDecision {
            request_id: request.request_id.clone(),
            organization_id: request.organization_id.clone(),
            model: request.model.clone(),
            backend_id: match &result {
                Ok(outcome) => Some(outcome.backend_id.clone()),
                Err(_) => trace.last_backend.clone(),
            },
            attempts: trace.attempts,
            latency_ms,
            outcome: match &result {
                Ok(_) => "success".to_string(),
                Err(e) => e.code().to_string(),
            },
            timestamp: Utc::now(),
        });

        self.record_usage(request, &result, &trace, estimated_cost, started.elapsed())
            .await;
        result
    }

    async fn route(
        &self,
        request: &DispatchRequest,
        estimated_cost: f64,
        cancel: &CancellationToken,
        trace: &mut AttemptTrace,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.admission
            .admit(
                &request.organization_id,
                request.api_key_id.as_deref(),
                estimated_cost,
            )
            .await?;

        let policy = self.resolve(&request.organization_id, &request.model)?;
        let candidates = self
            .health
            .candidates(&policy.backends, &policy.degraded_backends);
        let max_attempts = usize::try_from(policy.failover_threshold)
            .unwrap_or(usize::MAX)
            .min(candidates.len());
        let mut draw = WeightedDraw::new(candidates);

        let backend_request = BackendRequest {
            request_id: request.request_id.clone(),
            organization_id: request.organization_id.clone(),
            model: request.model.clone(),
            content_type: request.content_type.clone(),
            body: request.payload.clone(),
        };

        let mut failures: Vec<AttemptFailure> = Vec::new();
        while failures.len() < max_attempts {
            let Some(choice) = self.draw(&mut draw) else {
                break;
            };
            let backend_id = choice.backend_id;
            // Gone before the call started: nothing was observed about the backend.
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled { backend_id });
            }
            trace.attempts += 1;
            trace.last_backend = Some(backend_id.clone());

            let Some(endpoint) = self.registry.get(&backend_id) else {
                tracing::warn!(
                    request_id = %request.request_id,
                    backend_id = %backend_id,
                    "policy references a backend missing from the registry"
                );
                failures.push(AttemptFailure {
                    backend_id,
                    reason: "unknown backend".into(),
                });
                continue;
            };

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.health.report_failure(
                        &backend_id,
                        "cancelled by caller",
                        Observation::Dispatch,
                    );
                    return Err(DispatchError::Cancelled { backend_id });
                }
                result = self.transport.invoke(&endpoint, &backend_request) => result,
            };

            match result {
                Ok(reply) => {
                    self.health.report_success(&backend_id, Observation::Dispatch);
                    return Ok(DispatchOutcome {
                        request_id: request.request_id.clone(),
                        backend_id,
                        policy_organization: policy.organization_id.clone(),
                        reply,
                        failed_attempts: failures,
                    });
                }
                Err(failure) => {
                    let reason = failure.to_string();
                    self.health
                        .report_failure(&backend_id, &reason, Observation::Dispatch);
                    tracing::warn!(
                        request_id = %request.request_id,
                        backend_id = %backend_id,
                        attempt = trace.attempts,
                        max_attempts,
                        error = %reason,
                        "backend attempt failed"
                    );
                    failures.push(AttemptFailure { backend_id, reason });
                }
            }
        }

        Err(DispatchError::AllBackendsFailed { attempts: failures })
    }

    fn draw(&self, draw: &mut WeightedDraw) -> Option<BackendWeight> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        draw.next(&mut *rng)
    }

    async fn record_usage(
        &self,
        request: &DispatchRequest,
        result: &Result<DispatchOutcome, DispatchError>,
        trace: &AttemptTrace,
        estimated_cost: f64,
        elapsed: Duration,
    ) {
        let (status, error_code, backend_id, tokens) = match result {
            Ok(outcome) => (
                UsageStatus::Success,
                None,
                Some(outcome.backend_id.clone()),
                TokenUsage::from_reply(&outcome.reply.body),
            ),
            Err(e @ DispatchError::RateLimited { .. }) => {
                (UsageStatus::RateLimited, Some(e.code()), None, None)
            }
            Err(e) => (
                UsageStatus::Error,
                Some(e.code()),
                trace.last_backend.clone(),
                None,
            ),
        };

        let cost_usd = match (status, tokens) {
            (UsageStatus::Success, Some(tokens)) => {
                token_cost(tokens.total(), self.cost_per_1k_tokens)
            }
            (UsageStatus::Success, None) => estimated_cost,
            _ => 0.0,
        };
        let tokens = tokens.unwrap_or_default();

        let record = UsageRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            request_id: request.request_id.clone(),
            organization_id: request.organization_id.clone(),
            api_key_id: request.api_key_id.clone(),
            model: request.model.clone(),
            backend_id,
            tokens_input: tokens.input,
            tokens_output: tokens.output,
            latency_ms: saturating_millis(elapsed),
            cost_usd,
            status,
            error_code: error_code.map(str::to_string),
            attempts: trace.attempts,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.usage.append(&record).await {
            tracing::error!(
                request_id = %request.request_id,
                record_id = %record.record_id,
                error = %e,
                "failed to buffer usage record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use hyper::{HeaderMap, StatusCode};

    use super::*;
    use crate::admission::budget::AllowAllBudget;
    use crate::admission::rate_limiter::{MemoryRateLimitStore, RateLimit};
    use crate::error::Stage;
    use crate::policy::tests::policy;
    use crate::registry::BackendEndpoint;
    use crate::usage::buffer::FlushSettings;
    use crate::usage::publisher::TracingPublisher;
    use backend_client::BackendFailure;

    #[derive(Clone)]
    enum Behavior {
        Reply(&'static str),
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        behaviors: HashMap<String, Behavior>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn with(entries: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: entries
                    .iter()
                    .map(|(id, b)| ((*id).to_string(), b.clone()))
                    .collect(),
                calls: StdMutex::default(),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BackendTransport for ScriptedTransport {
        async fn invoke(
            &self,
            endpoint: &BackendEndpoint,
            _: &BackendRequest,
        ) -> Result<BackendReply, BackendFailure> {
            self.calls.lock().unwrap().push(endpoint.id.clone());
            match self.behaviors.get(&endpoint.id).cloned().unwrap_or(Behavior::Fail) {
                Behavior::Reply(body) => Ok(BackendReply {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(body.as_bytes()),
                    latency: Duration::from_millis(1),
                }),
                Behavior::Fail => Err(BackendFailure::Status(StatusCode::SERVICE_UNAVAILABLE)),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn probe(&self, _: &BackendEndpoint, _: Duration) -> Result<(), BackendFailure> {
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        policies: Arc<PolicySet>,
        health: Arc<HealthMonitor>,
        usage: Arc<UsageBuffer>,
        transport: Arc<ScriptedTransport>,
        dispatcher: Dispatcher,
    }

    impl Harness {
        async fn new(backends: &str, transport: Arc<ScriptedTransport>, burst: u32) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let policies = Arc::new(PolicySet::new());
            let registry =
                Arc::new(BackendRegistry::from_list(backends, Duration::from_secs(5)).unwrap());
            let health = Arc::new(HealthMonitor::new(3));
            let admission = Arc::new(AdmissionController::new(
                Arc::new(MemoryRateLimitStore::new()),
                RateLimit {
                    rate_per_sec: 0.0,
                    burst,
                },
                Arc::new(AllowAllBudget),
                Duration::from_secs(1),
            ));
            let publisher = Arc::new(TracingPublisher::new());
            let usage = Arc::new(
                UsageBuffer::open(dir.path(), publisher, FlushSettings::default())
                    .await
                    .unwrap(),
            );
            let dispatcher = Dispatcher::new(
                Arc::clone(&policies),
                registry,
                Arc::clone(&health),
                admission,
                transport.clone(),
                Arc::clone(&usage),
                0.002,
            )
            .with_seed(42);
            Self {
                _dir: dir,
                policies,
                health,
                usage,
                transport,
                dispatcher,
            }
        }

        fn records(&self) -> Vec<UsageRecord> {
            let mut paths: Vec<_> = std::fs::read_dir(self.usage.dir())
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect();
            paths.sort();
            paths
                .iter()
                .map(|p| serde_json::from_slice(&std::fs::read(p).unwrap()).unwrap())
                .collect()
        }

        async fn dispatch(&self, org: &str, model: &str) -> Result<DispatchOutcome, DispatchError> {
            self.dispatcher
                .dispatch(&DispatchRequest::new(org, model, "{}"), &CancellationToken::new())
                .await
        }
    }

    const BACKENDS: &str = "b1:http://b1.test,b2:http://b2.test,b3:http://b3.test";

    #[tokio::test]
    async fn organization_policy_wins_then_global_then_none() {
        let transport = ScriptedTransport::with(&[
            ("b1", Behavior::Reply("{}")),
            ("b2", Behavior::Reply("{}")),
        ]);
        let h = Harness::new(BACKENDS, transport, 100).await;
        h.policies.apply(policy("*", "m", 1, &[("b2", 1)]));

        let global = h.dispatch("acme", "m").await.unwrap();
        assert_eq!(global.backend_id, "b2");
        assert_eq!(global.policy_organization, "*");

        h.policies.apply(policy("acme", "m", 1, &[("b1", 1)]));
        assert_eq!(h.dispatch("acme", "m").await.unwrap().backend_id, "b1");

        let err = h.dispatch("acme", "other-model").await.unwrap_err();
        assert!(matches!(err, DispatchError::NoRoutingPolicy { .. }));
        assert_eq!(err.stage(), Stage::PolicyResolution);
        assert_eq!(h.transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn failover_exhaustion_tries_exactly_threshold_backends() {
        let h = Harness::new(BACKENDS, ScriptedTransport::with(&[]), 100).await;
        let mut p = policy("acme", "m", 1, &[("b1", 1), ("b2", 1), ("b3", 1)]);
        p.failover_threshold = 2;
        h.policies.apply(p);
        for id in ["b1", "b2", "b3"] {
            for _ in 0..3 {
                h.health.report_failure(id, "probe failed", Observation::Probe);
            }
        }

        let err = h.dispatch("acme", "m").await.unwrap_err();
        let DispatchError::AllBackendsFailed { attempts } = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(attempts.len(), 2);
        assert_ne!(attempts[0].backend_id, attempts[1].backend_id);
        assert_eq!(h.transport.calls().len(), 2);
        assert!(err.to_string().contains(&attempts[0].backend_id));
        assert!(err.to_string().contains(&attempts[1].backend_id));
    }

    #[tokio::test]
    async fn fails_over_to_next_backend() {
        let transport = ScriptedTransport::with(&[
            ("b1", Behavior::Fail),
            (
                "b2",
                Behavior::Reply(r#"{"usage": {"prompt_tokens": 10, "completion_tokens": 490}}"#),
            ),
        ]);
        let h = Harness::new(BACKENDS, transport, 100).await;
        // b1 is drawn first whenever it carries all the weight.
        h.policies.apply(policy("acme", "m", 1, &[("b1", 1000), ("b2", 0)]));

        let outcome = h.dispatch("acme", "m").await.unwrap();
        assert_eq!(outcome.backend_id, "b2");
        assert_eq!(outcome.failed_attempts.len(), 1);
        assert_eq!(h.health.state("b1").unwrap().consecutive_failures, 1);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, UsageStatus::Success);
        assert_eq!(records[0].attempts, 2);
        assert_eq!(records[0].tokens_input + records[0].tokens_output, 500);
        assert!((records[0].cost_usd - 0.001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn unknown_backend_counts_as_attempt_without_health_change() {
        let transport = ScriptedTransport::with(&[("b1", Behavior::Reply("{}"))]);
        let h = Harness::new("b1:http://b1.test", transport, 100).await;
        h.policies.apply(policy("acme", "m", 1, &[("ghost", 1000), ("b1", 0)]));

        let outcome = h.dispatch("acme", "m").await.unwrap();
        assert_eq!(outcome.backend_id, "b1");
        assert_eq!(outcome.failed_attempts[0].reason, "unknown backend");
        assert!(h.health.state("ghost").is_none());
    }

    #[tokio::test]
    async fn rate_limited_request_reaches_no_backend() {
        let transport = ScriptedTransport::with(&[("b1", Behavior::Reply("{}"))]);
        let h = Harness::new(BACKENDS, transport, 2).await;
        h.policies.apply(policy("acme", "m", 1, &[("b1", 1)]));

        assert!(h.dispatch("acme", "m").await.is_ok());
        assert!(h.dispatch("acme", "m").await.is_ok());
        let err = h.dispatch("acme", "m").await.unwrap_err();
        assert!(matches!(err, DispatchError::RateLimited { .. }));
        assert_eq!(h.transport.calls().len(), 2);

        let records = h.records();
        assert_eq!(records.len(), 3);
        let limited: Vec<_> = records
            .iter()
            .filter(|r| r.status == UsageStatus::RateLimited)
            .collect();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].error_code.as_deref(), Some("RATE_LIMIT_EXCEEDED"));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_call_and_still_records() {
        let transport = ScriptedTransport::with(&[("b1", Behavior::Hang)]);
        let h = Harness::new(BACKENDS, transport, 100).await;
        h.policies.apply(policy("acme", "m", 1, &[("b1", 1)]));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = h
            .dispatcher
            .dispatch(&DispatchRequest::new("acme", "m", "{}"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled { ref backend_id } if backend_id == "b1"));
        assert_eq!(h.transport.calls(), vec!["b1"]);
        assert_eq!(h.health.state("b1").unwrap().consecutive_failures, 1);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_code.as_deref(), Some("REQUEST_CANCELLED"));
    }

    #[tokio::test]
    async fn cancelled_before_the_call_leaves_health_untouched() {
        let transport = ScriptedTransport::with(&[("b1", Behavior::Reply("{}"))]);
        let h = Harness::new(BACKENDS, transport, 100).await;
        h.policies.apply(policy("acme", "m", 1, &[("b1", 1)]));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h
            .dispatcher
            .dispatch(&DispatchRequest::new("acme", "m", "{}"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled { ref backend_id } if backend_id == "b1"));
        assert!(h.transport.calls().is_empty());
        assert!(h.health.state("b1").is_none());

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_code.as_deref(), Some("REQUEST_CANCELLED"));
        assert_eq!(records[0].attempts, 0);
    }

    #[tokio::test]
    async fn policy_degraded_backend_is_not_tried() {
        let transport = ScriptedTransport::with(&[
            ("b1", Behavior::Reply("{}")),
            ("b2", Behavior::Reply("{}")),
        ]);
        let h = Harness::new(BACKENDS, transport, 100).await;
        let mut p = policy("acme", "m", 1, &[("b1", 1000), ("b2", 1)]);
        p.degraded_backends = vec!["b1".into()];
        h.policies.apply(p);

        for _ in 0..5 {
            assert_eq!(h.dispatch("acme", "m").await.unwrap().backend_id, "b2");
        }
        assert!(h.transport.calls().iter().all(|id| id == "b2"));
    }

    #[tokio::test]
    async fn operator_hold_takes_backend_out_of_rotation() {
        let transport = ScriptedTransport::with(&[
            ("b1", Behavior::Reply("{}")),
            ("b2", Behavior::Reply("{}")),
        ]);
        let h = Harness::new(BACKENDS, transport, 100).await;
        h.policies.apply(policy("acme", "m", 1, &[("b1", 1000), ("b2", 1)]));

        h.health.hold("b1", None);
        assert_eq!(h.dispatch("acme", "m").await.unwrap().backend_id, "b2");

        h.health.hold("b2", None);
        let err = h.dispatch("acme", "m").await.unwrap_err();
        assert!(
            matches!(err, DispatchError::AllBackendsFailed { ref attempts } if attempts.is_empty())
        );

        h.health.release("b1");
        assert_eq!(h.dispatch("acme", "m").await.unwrap().backend_id, "b1");
    }

    #[tokio::test]
    async fn decisions_record_each_dispatch() {
        let transport = ScriptedTransport::with(&[("b1", Behavior::Reply("{}"))]);
        let h = Harness::new(BACKENDS, transport, 100).await;
        h.policies.apply(policy("acme", "m", 1, &[("b1", 1)]));

        h.dispatch("acme", "m").await.unwrap();
        let _ = h.dispatch("acme", "missing").await;

        let decisions = h.dispatcher.decisions().recent(10);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].backend_id.as_deref(), Some("b1"));
        assert_eq!(decisions[0].outcome, "success");
        assert_eq!(decisions[0].attempts, 1);
        assert_eq!(decisions[1].outcome, "NO_ROUTING_POLICY");
        assert!(decisions[1].backend_id.is_none());
        assert_eq!(decisions[1].attempts, 0);
    }

    #[tokio::test]
    async fn every_dispatch_writes_one_record() {
        let transport = ScriptedTransport::with(&[("b1", Behavior::Reply("{}"))]);
        let h = Harness::new(BACKENDS, transport, 100).await;
        h.policies.apply(policy("acme", "m", 1, &[("b1", 1)]));

        let _ = h.dispatch("acme", "m").await;
        let _ = h.dispatch("acme", "missing").await;
        let _ = h.dispatch("other", "m").await;
        assert_eq!(h.usage.pending(), 3);
        assert_eq!(h.records().len(), 3);
    }
}
