//! HTTP handlers for the dispatch endpoint and the admin surface.
//!
//! [`dispatch`] serves `POST /v1/dispatch/{model}`; [`admin`] holds the
//! backend registry, health override, decision log and policy endpoints.
//! Errors on both are rendered as JSON by [`ErrorBody`].

pub mod admin;
pub mod dispatch;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::{AttemptFailure, DispatchError, Stage};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Non-standard "client closed request".
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<Vec<AttemptFailure>>,
}

impl ErrorBody {
    pub fn new(code: &'static str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
            stage: None,
            attempts: None,
        }
    }

    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

#[must_use]
pub fn dispatch_status(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::BudgetDenied { .. } => StatusCode::PAYMENT_REQUIRED,
        DispatchError::NoRoutingPolicy { .. } => StatusCode::NOT_FOUND,
        DispatchError::AllBackendsFailed { .. } => StatusCode::BAD_GATEWAY,
        DispatchError::Cancelled { .. } => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_GATEWAY)
        }
    }
}

/// JSON error response for a failed dispatch, with `Retry-After` on 429.
#[must_use]
pub fn dispatch_error_response(err: &DispatchError, request_id: &str) -> Response {
    let attempts = match err {
        DispatchError::AllBackendsFailed { attempts } => Some(attempts.clone()),
        _ => None,
    };
    let body = ErrorBody {
        error: err.to_string(),
        code: err.code(),
        stage: Some(err.stage()),
        attempts,
    };

    let mut response = body.into_response_with(dispatch_status(err));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let DispatchError::RateLimited {
        retry_after: Some(wait),
        ..
    } = err
    {
        // Whole seconds, rounded up, never zero.
        let secs = wait
            .as_secs()
            .saturating_add(u64::from(wait.subsec_nanos() > 0));
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(secs.max(1)),
        );
    }
    response
}
