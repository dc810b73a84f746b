//! Router wiring: shared request state, the axum router, the outbound
//! client used for every backend call, and shutdown signalling.
//!
//! Contains [`AppState`] (the `Arc`-shared handles to the dispatcher, policy
//! source, registry, health monitor and usage buffer, plus counters and
//! uptime), [`build_router`] for the HTTP surface, [`build_http_client`]
//! for the one pooled client used by every outbound call, and
//! [`shutdown_signal`] for SIGTERM / Ctrl+C handling.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post, put};
use axum::Router;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::admission::AdmissionController;
use crate::api;
use crate::health::health_handler;
use crate::policy::source::PolicySource;
use crate::registry::BackendRegistry;
use crate::routing::health_monitor::HealthMonitor;
use crate::routing::Dispatcher;
use crate::usage::buffer::UsageBuffer;

#[derive(Debug)]
pub struct Stats {
    pub dispatched: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

pub type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;
pub type HttpClient = Client<HttpsConnector, http_body_util::Full<bytes::Bytes>>;

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub policy_source: Arc<PolicySource>,
    pub registry: Arc<BackendRegistry>,
    pub health: Arc<HealthMonitor>,
    pub admission: Arc<AdmissionController>,
    pub usage: Arc<UsageBuffer>,
    pub start_time: Instant,
    pub stats: Stats,
}

#[must_use]
pub fn build_http_client() -> HttpClient {
    // When multiple rustls crypto providers are compiled in, rustls cannot
    // auto-detect which one to use. Explicitly install `ring` as the default.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .build(https)
}

pub fn build_router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/dispatch/{model}", post(api::dispatch::dispatch_handler))
        .route("/admin/backends", get(api::admin::list_backends))
        .route("/admin/backends/{id}", put(api::admin::register_backend))
        .route("/admin/backends/{id}/health", get(api::admin::backend_health))
        .route(
            "/admin/backends/{id}/degrade",
            post(api::admin::degrade_backend),
        )
        .route(
            "/admin/backends/{id}/healthy",
            post(api::admin::mark_backend_healthy),
        )
        .route("/admin/decisions", get(api::admin::recent_decisions))
        .route("/admin/policies/refresh", post(api::admin::refresh_policies))
        .route(
            "/admin/policies/{organization_id}/{model}",
            get(api::admin::resolve_policy),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body)),
        )
        .with_state(state)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
