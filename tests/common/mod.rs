//! Shared fixtures: fake backends served by axum and a fully wired router
//! bound to an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use inference_router::admission::budget::{AllowAllBudget, BudgetOracle, HttpBudgetOracle};
use inference_router::admission::rate_limiter::{MemoryRateLimitStore, RateLimit};
use inference_router::admission::AdmissionController;
use inference_router::policy::cache::PolicyCache;
use inference_router::policy::model::{BackendWeight, RoutingPolicy};
use inference_router::policy::source::{PolicySource, PolicySourceSettings};
use inference_router::policy::stores::memory::MemoryStore;
use inference_router::policy::PolicyStore;
use inference_router::registry::BackendRegistry;
use inference_router::routing::backend_client::{BackendTransport, HyperTransport};
use inference_router::routing::health_monitor::HealthMonitor;
use inference_router::routing::Dispatcher;
use inference_router::server::{self, AppState, Stats};
use inference_router::usage::buffer::{FlushSettings, UsageBuffer};
use inference_router::usage::publisher::TracingPublisher;

pub fn policy(org: &str, model: &str, version: u64, backends: &[(&str, u32)]) -> RoutingPolicy {
    RoutingPolicy {
        organization_id: org.into(),
        model: model.into(),
        backends: backends
            .iter()
            .map(|(id, weight)| BackendWeight {
                backend_id: (*id).into(),
                weight: *weight,
            })
            .collect(),
        failover_threshold: 2,
        degraded_backends: Vec::new(),
        version,
        updated_at: chrono::Utc::now(),
    }
}

#[derive(Clone)]
struct BackendState {
    status: StatusCode,
    body: &'static str,
    delay: Duration,
    hits: Arc<AtomicUsize>,
    healthy: Arc<AtomicBool>,
}

async fn infer(State(state): State<BackendState>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(state.delay).await;
    (
        state.status,
        [("content-type", "application/json")],
        state.body,
    )
}

async fn health(State(state): State<BackendState>) -> StatusCode {
    if state.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub struct FakeBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    pub healthy: Arc<AtomicBool>,
    _shutdown: oneshot::Sender<()>,
}

impl FakeBackend {
    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn spawn_backend(status: u16, body: &'static str) -> FakeBackend {
    spawn_backend_with_delay(status, body, Duration::ZERO).await
}

pub async fn spawn_backend_with_delay(
    status: u16,
    body: &'static str,
    delay: Duration,
) -> FakeBackend {
    let hits = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicBool::new(true));
    let state = BackendState {
        status: StatusCode::from_u16(status).unwrap(),
        body,
        delay,
        hits: Arc::clone(&hits),
        healthy: Arc::clone(&healthy),
    };
    let router = Router::new()
        .route("/", post(infer))
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    FakeBackend {
        addr,
        hits,
        healthy,
        _shutdown: shutdown_tx,
    }
}

/// `id:uri` list for the given backends.
pub fn backend_list(backends: &[(&str, &FakeBackend)]) -> String {
    backends
        .iter()
        .map(|(id, b)| format!("{id}:{}", b.uri()))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct RouterOptions {
    pub backends: String,
    /// Held by the config store.
    pub policies: Vec<RoutingPolicy>,
    /// Pre-seeded into the policy cache.
    pub cached: Vec<RoutingPolicy>,
    pub store_available: bool,
    pub rate: RateLimit,
    pub budget_endpoint: Option<String>,
    pub watch: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            backends: String::new(),
            policies: Vec::new(),
            cached: Vec::new(),
            store_available: true,
            rate: RateLimit {
                rate_per_sec: 1000.0,
                burst: 1000,
            },
            budget_endpoint: None,
            watch: false,
        }
    }
}

pub struct TestRouter {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub dir: tempfile::TempDir,
    cancel: CancellationToken,
    _shutdown: oneshot::Sender<()>,
}

impl TestRouter {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn dispatch(&self, org: &str, model: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(self.url(&format!("/v1/dispatch/{model}")))
            .header("x-organization-id", org)
            .header("content-type", "application/json")
            .body(r#"{"prompt": "hello", "max_tokens": 16}"#)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestRouter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn start_router(options: RouterOptions) -> TestRouter {
    let dir = tempfile::tempdir().unwrap();
    let client = server::build_http_client();

    let registry =
        Arc::new(BackendRegistry::from_list(&options.backends, Duration::from_secs(2)).unwrap());

    let store = Arc::new(MemoryStore::with_policies(options.policies));
    store.set_available(options.store_available);

    let cache = PolicyCache::open(&dir.path().join("policy-cache.db")).await.unwrap();
    for policy in &options.cached {
        cache.put(policy).await.unwrap();
    }

    let policy_source = Arc::new(PolicySource::new(
        Some(Arc::clone(&store) as Arc<dyn PolicyStore>),
        cache,
        PolicySourceSettings {
            watch_enabled: true,
            store_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(50),
        },
    ));
    policy_source.load().await.unwrap();

    let budget: Arc<dyn BudgetOracle> = match options.budget_endpoint {
        Some(ref endpoint) => Arc::new(HttpBudgetOracle::new(client.clone(), endpoint).unwrap()),
        None => Arc::new(AllowAllBudget),
    };
    let admission = Arc::new(AdmissionController::new(
        Arc::new(MemoryRateLimitStore::new()),
        options.rate,
        budget,
        Duration::from_millis(500),
    ));

    let usage = Arc::new(
        UsageBuffer::open(
            dir.path().join("usage"),
            Arc::new(TracingPublisher::new()),
            FlushSettings::default(),
        )
        .await
        .unwrap(),
    );

    let health = Arc::new(HealthMonitor::new(3));
    let transport: Arc<dyn BackendTransport> = Arc::new(HyperTransport::new(client));
    let dispatcher = Arc::new(
        Dispatcher::new(
            policy_source.policies(),
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&admission),
            transport,
            Arc::clone(&usage),
            0.002,
        )
        .with_seed(7),
    );

    let cancel = CancellationToken::new();
    if options.watch {
        tokio::spawn(Arc::clone(&policy_source).watch(cancel.child_token()));
    }

    let state = Arc::new(AppState {
        dispatcher,
        policy_source,
        registry,
        health,
        admission,
        usage,
        start_time: Instant::now(),
        stats: Stats::new(),
    });

    let router = server::build_router(Arc::clone(&state), 1_048_576);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    TestRouter {
        addr,
        state,
        store,
        dir,
        cancel,
        _shutdown: shutdown_tx,
    }
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{what} not reached in time");
}
