//! Unified error types for the router.
//!
//! [`RouterError`] covers infrastructure and startup failures (config
//! store, policy cache, usage pipeline, CLI I/O). [`DispatchError`] is the
//! caller-visible taxonomy produced on the request path; every variant
//! knows which [`Stage`] produced it. [`ValidationError`] reports policy
//! validation problems with per-field suggestions.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub policy: String,
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "  policy {}: {}: {}", self.policy, self.field, self.message)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

fn format_errors(errors: &[ValidationError]) -> String {
    use std::fmt::Write;
    let mut buf = String::new();
    for (i, e) in errors.iter().enumerate() {
        if i > 0 {
            buf.push('\n');
        }
        // write! to String is infallible
        let _ = write!(buf, "{e}");
    }
    buf
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RouterError {
    #[error(
        "No routing policies available: config store and policy cache are both empty or unreachable"
    )]
    NoPolicySources,

    #[error("Config store '{store}' unavailable: {source}")]
    ConfigSourceUnavailable {
        store: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Policy cache error: {0}")]
    PolicyCache(#[from] sqlx::Error),

    #[error("Policy parse error in {path}:\n  {source}")]
    PolicyParse {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Policy validation failed:\n{}", format_errors(.errors))]
    PolicyValidation { errors: Vec<ValidationError> },

    #[error("Unsupported policy file format: '{0}'")]
    UnsupportedFormat(String),

    #[error("Policy file not found: {}", path.display())]
    PolicyFileNotFound { path: PathBuf },

    #[error("Invalid backend entries:\n  {}", .0.join("\n  "))]
    InvalidBackendSpec(Vec<String>),

    #[error("Invalid address: {0}")]
    AddressParse(#[from] std::net::AddrParseError),

    #[error("Invalid URI: {source}")]
    UriParse {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("HTTP request failed: {source}")]
    HttpRequest {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Health check failed with status {0}")]
    HealthCheckFailed(hyper::StatusCode),

    #[error("Usage publisher '{publisher}' failed: {source}")]
    DownstreamPublishFailed {
        publisher: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Rate limit store error: {source}")]
    RateLimitStore {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Which step of the request path produced a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Admission,
    PolicyResolution,
    Dispatch,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Admission => "admission",
            Self::PolicyResolution => "policy resolution",
            Self::Dispatch => "dispatch",
        })
    }
}

/// One failed backend attempt inside a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub backend_id: String,
    pub reason: String,
}

fn format_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.backend_id, a.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("admission: rate limit exceeded for {scope}")]
    RateLimited {
        scope: String,
        retry_after: Option<Duration>,
    },

    #[error("admission: budget denied for organization '{organization_id}': {reason}")]
    BudgetDenied {
        organization_id: String,
        reason: String,
    },

    #[error(
        "policy resolution: no routing policy for organization '{organization_id}' \
         and model '{model}'"
    )]
    NoRoutingPolicy {
        organization_id: String,
        model: String,
    },

    #[error(
        "dispatch: all backends failed after {} attempt(s): {}",
        .attempts.len(),
        format_attempts(.attempts)
    )]
    AllBackendsFailed { attempts: Vec<AttemptFailure> },

    #[error("dispatch: request cancelled while calling backend '{backend_id}'")]
    Cancelled { backend_id: String },
}

impl DispatchError {
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::RateLimited { .. } | Self::BudgetDenied { .. } => Stage::Admission,
            Self::NoRoutingPolicy { .. } => Stage::PolicyResolution,
            Self::AllBackendsFailed { .. } | Self::Cancelled { .. } => Stage::Dispatch,
        }
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::BudgetDenied { .. } => "BUDGET_EXCEEDED",
            Self::NoRoutingPolicy { .. } => "NO_ROUTING_POLICY",
            Self::AllBackendsFailed { .. } => "ALL_BACKENDS_FAILED",
            Self::Cancelled { .. } => "REQUEST_CANCELLED",
        }
    }

    /// Whether the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::AllBackendsFailed { .. } | Self::Cancelled { .. }
        )
    }

    /// Last backend failure reason, for `AllBackendsFailed`.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::AllBackendsFailed { attempts } => attempts.last().map(|a| a.reason.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_backends_failed_names_every_attempt() {
        let err = DispatchError::AllBackendsFailed {
            attempts: vec![
                AttemptFailure {
                    backend_id: "b1".into(),
                    reason: "timed out".into(),
                },
                AttemptFailure {
                    backend_id: "b2".into(),
                    reason: "status 503".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("dispatch:"));
        assert!(msg.contains("b1 (timed out)"));
        assert!(msg.contains("b2 (status 503)"));
        assert_eq!(err.last_error(), Some("status 503"));
        assert_eq!(err.stage(), Stage::Dispatch);
        assert!(err.is_retryable());
    }

    #[test]
    fn admission_errors_report_stage_and_code() {
        let err = DispatchError::BudgetDenied {
            organization_id: "acme".into(),
            reason: "monthly budget exhausted".into(),
        };
        assert_eq!(err.stage(), Stage::Admission);
        assert_eq!(err.code(), "BUDGET_EXCEEDED");
        assert!(!err.is_retryable());

        let err = DispatchError::NoRoutingPolicy {
            organization_id: "acme".into(),
            model: "gpt-lite".into(),
        };
        assert_eq!(err.stage(), Stage::PolicyResolution);
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_error_display_includes_suggestion() {
        let err = ValidationError {
            policy: "acme/gpt-lite".into(),
            field: "failover_threshold".into(),
            message: "must be at least 1".into(),
            suggestion: Some("set it to 1 to disable failover".into()),
        };
        assert_eq!(
            err.to_string(),
            "  policy acme/gpt-lite: failover_threshold: must be at least 1 \
             (set it to 1 to disable failover)"
        );
    }
}
