//! Admin endpoints: backend registry and operator health overrides, recent
//! routing decisions, forced policy refresh, policy lookup.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{dispatch_status, ErrorBody};
use crate::error::RouterError;
use crate::policy::model::{RoutingPolicy, GLOBAL_ORGANIZATION};
use crate::policy::source::ReconcileSummary;
use crate::registry::{saturating_millis, BackendEndpoint};
use crate::routing::decisions::RoutingDecision;
use crate::routing::health_monitor::BackendHealthView;
use crate::server::AppState;

#[derive(Serialize)]
pub struct BackendEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// False for ids only seen through policies or health checks.
    pub registered: bool,
    #[serde(flatten)]
    pub health: BackendHealthView,
}

#[derive(Serialize)]
pub struct BackendsResponse {
    pub backends: Vec<BackendEntry>,
}

pub async fn list_backends(State(state): State<Arc<AppState>>) -> Json<BackendsResponse> {
    let backends = state
        .health
        .snapshot(&state.registry)
        .into_iter()
        .map(|health| {
            let endpoint = state.registry.get(&health.backend_id);
            BackendEntry {
                uri: endpoint.as_ref().map(|e| e.uri.to_string()),
                timeout_ms: endpoint
                    .as_ref()
                    .map(|e| saturating_millis(e.timeout)),
                registered: endpoint.is_some(),
                health,
            }
        })
        .collect();
    Json(BackendsResponse { backends })
}

#[derive(Debug, Deserialize)]
pub struct RegisterBackend {
    pub uri: String,
    pub timeout_ms: Option<u64>,
}

pub async fn register_backend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RegisterBackend>,
) -> Response {
    let timeout = body.timeout_ms.map(Duration::from_millis);
    match state.registry.register(&id, &body.uri, timeout) {
        Ok((endpoint, created)) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(BackendEndpoint::clone(&endpoint))).into_response()
        }
        Err(e) => ErrorBody::new("INVALID_BACKEND", e.to_string())
            .into_response_with(StatusCode::BAD_REQUEST),
    }
}

fn backend_not_found(id: &str) -> Response {
    ErrorBody::new("BACKEND_NOT_FOUND", format!("backend '{id}' not found"))
        .into_response_with(StatusCode::NOT_FOUND)
}

/// `GET /admin/backends/{id}/health`
pub async fn backend_health(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.health.view(&id, &state.registry) {
        Some(view) => Json(view).into_response(),
        None => backend_not_found(&id),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DegradeBackend {
    pub reason: Option<String>,
}

/// `POST /admin/backends/{id}/degrade`; body `{"reason"?: string}` or empty.
pub async fn degrade_backend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if state.registry.get(&id).is_none() {
        return backend_not_found(&id);
    }
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        DegradeBackend::default()
    } else {
        match serde_json::from_slice::<DegradeBackend>(&body) {
            Ok(request) => request,
            Err(e) => {
                return ErrorBody::new("INVALID_REQUEST", format!("invalid request body: {e}"))
                    .into_response_with(StatusCode::BAD_REQUEST)
            }
        }
    };

    state.health.hold(&id, request.reason);
    backend_health(State(state), Path(id)).await
}

/// `POST /admin/backends/{id}/healthy`: clears an operator hold and the
/// failure history.
pub async fn mark_backend_healthy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if state.registry.get(&id).is_none() {
        return backend_not_found(&id);
    }
    state.health.release(&id);
    backend_health(State(state), Path(id)).await
}

#[derive(Debug, Deserialize)]
pub struct DecisionsQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct DecisionsResponse {
    pub decisions: Vec<RoutingDecision>,
}

/// `GET /admin/decisions?limit=N`, oldest first.
pub async fn recent_decisions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DecisionsQuery>,
) -> Json<DecisionsResponse> {
    let log = state.dispatcher.decisions();
    let limit = query.limit.unwrap_or_else(|| log.capacity());
    Json(DecisionsResponse {
        decisions: log.recent(limit),
    })
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub store: &'static str,
    pub policies: usize,
    #[serde(flatten)]
    pub summary: ReconcileSummary,
}

pub async fn refresh_policies(State(state): State<Arc<AppState>>) -> Response {
    match state.policy_source.refresh().await {
        Ok(summary) => Json(RefreshResponse {
            store: state.policy_source.store_name().unwrap_or("none"),
            policies: state.policy_source.policies().len(),
            summary,
        })
        .into_response(),
        Err(e @ RouterError::ConfigSourceUnavailable { .. }) => {
            tracing::warn!(error = %e, "forced policy refresh failed");
            ErrorBody::new("CONFIG_SOURCE_UNAVAILABLE", e.to_string())
                .into_response_with(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(e) => {
            tracing::error!(error = %e, "forced policy refresh failed");
            ErrorBody::new("INTERNAL_ERROR", e.to_string())
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Serialize)]
pub struct ResolvedPolicy {
    /// True when no organization-specific policy exists and the global one applies.
    pub global_fallback: bool,
    pub policy: RoutingPolicy,
}

pub async fn resolve_policy(
    State(state): State<Arc<AppState>>,
    Path((organization_id, model)): Path<(String, String)>,
) -> Response {
    match state.dispatcher.resolve(&organization_id, &model) {
        Ok(policy) => Json(ResolvedPolicy {
            global_fallback: policy.is_global() && organization_id != GLOBAL_ORGANIZATION,
            policy: RoutingPolicy::clone(&policy),
        })
        .into_response(),
        Err(e) => ErrorBody::new(e.code(), e.to_string()).into_response_with(dispatch_status(&e)),
    }
}
