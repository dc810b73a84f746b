//! `POST /v1/dispatch/{model}`.
//!
//! The dispatch runs on its own task so that health and usage bookkeeping
//! completes even when the caller disconnects; dropping the handler future
//! cancels the in-flight backend call through a [`CancellationToken`].

use std::sync::atomic::Ordering;
use std::sync::{Arc, LazyLock};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;

use super::{dispatch_error_response, ErrorBody, REQUEST_ID_HEADER};
use crate::error::Stage;
use crate::routing::{DispatchOutcome, DispatchRequest};
use crate::server::AppState;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const API_KEY_HEADER: &str = "x-api-key-id";
pub const BACKEND_ID_HEADER: &str = "x-backend-id";

static HOP_BY_HOP: LazyLock<Vec<HeaderName>> = LazyLock::new(|| {
    [
        "connection",
        "keep-alive",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "proxy-authorization",
        "proxy-authenticate",
    ]
    .iter()
    .filter_map(|name| name.parse::<HeaderName>().ok())
    .collect()
});

/// Strip hop-by-hop headers and `content-length` from a backend reply.
/// The body is already collected; axum sets the real length.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove(hyper::header::CONTENT_LENGTH);
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = header_str(&headers, REQUEST_ID_HEADER)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);

    let Some(organization_id) = header_str(&headers, ORGANIZATION_HEADER) else {
        state.stats.rejected.fetch_add(1, Ordering::Relaxed);
        return ErrorBody::new("MISSING_ORGANIZATION", "missing x-organization-id header")
            .into_response_with(StatusCode::BAD_REQUEST);
    };

    let request = DispatchRequest {
        request_id: request_id.clone(),
        organization_id: organization_id.to_string(),
        api_key_id: header_str(&headers, API_KEY_HEADER).map(String::from),
        model,
        content_type: headers.get(hyper::header::CONTENT_TYPE).cloned(),
        payload: body,
    };

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let dispatcher = Arc::clone(&state.dispatcher);
    let task = tokio::spawn(async move { dispatcher.dispatch(&request, &cancel).await });

    let result = match task.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "dispatch task failed");
            state.stats.failed.fetch_add(1, Ordering::Relaxed);
            return ErrorBody::new("INTERNAL_ERROR", "dispatch task failed")
                .into_response_with(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match result {
        Ok(outcome) => {
            state.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            success_response(outcome)
        }
        Err(e) => {
            let counter = match e.stage() {
                Stage::Admission | Stage::PolicyResolution => &state.stats.rejected,
                Stage::Dispatch => &state.stats.failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            dispatch_error_response(&e, &request_id)
        }
    }
}

fn success_response(outcome: DispatchOutcome) -> Response {
    let DispatchOutcome {
        request_id,
        backend_id,
        reply,
        ..
    } = outcome;

    let mut headers = reply.headers;
    strip_hop_by_hop(&mut headers);
    if let Ok(value) = HeaderValue::from_str(&backend_id) {
        headers.insert(BACKEND_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    (reply.status, headers, reply.body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_and_length() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn blank_headers_count_as_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(ORGANIZATION_HEADER, HeaderValue::from_static("  "));
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(" key-1 "));
        assert_eq!(header_str(&headers, ORGANIZATION_HEADER), None);
        assert_eq!(header_str(&headers, API_KEY_HEADER), Some("key-1"));
    }
}
