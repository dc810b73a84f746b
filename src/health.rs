//! `GET /health` endpoint handler.
//!
//! Returns a [`HealthResponse`] JSON payload containing the router version,
//! uptime, policy count and load origin, backend health totals, the usage
//! queue depth and cumulative request statistics.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::server::AppState;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub policies: PolicyHealth,
    pub backends: BackendTotals,
    pub usage: UsageHealth,
    pub stats: StatsResponse,
}

#[derive(Serialize, Deserialize)]
pub struct PolicyHealth {
    pub count: usize,
    /// `store` or `cache`; absent before the first load.
    pub origin: Option<String>,
    pub store: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct BackendTotals {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

#[derive(Serialize, Deserialize)]
pub struct UsageHealth {
    pub pending_records: usize,
    pub publisher: String,
}

#[derive(Serialize, Deserialize)]
pub struct StatsResponse {
    pub requests_dispatched: u64,
    pub requests_failed: u64,
    pub requests_rejected: u64,
    pub rate_limit_fail_open: u64,
    pub budget_fail_open: u64,
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.health.snapshot(&state.registry);
    let unhealthy = snapshot
        .iter()
        .filter(|b| !b.routable)
        .count();
    let admission = state.admission.stats();

    // Degraded when no known backend is routable.
    let status = if !snapshot.is_empty() && unhealthy == snapshot.len() {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        policies: PolicyHealth {
            count: state.policy_source.policies().len(),
            origin: state.policy_source.origin().map(|o| o.to_string()),
            store: state.policy_source.store_name().map(String::from),
        },
        backends: BackendTotals {
            total: snapshot.len(),
            healthy: snapshot.len() - unhealthy,
            unhealthy,
        },
        usage: UsageHealth {
            pending_records: state.usage.pending(),
            publisher: state.usage.publisher_name().to_string(),
        },
        stats: StatsResponse {
            requests_dispatched: state.stats.dispatched.load(Ordering::Relaxed),
            requests_failed: state.stats.failed.load(Ordering::Relaxed),
            requests_rejected: state.stats.rejected.load(Ordering::Relaxed),
            rate_limit_fail_open: admission.rate_limit_fail_open,
            budget_fail_open: admission.budget_fail_open,
        },
    })
}
