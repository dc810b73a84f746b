//! Usage accounting: one [`UsageRecord`] per dispatch, queued durably in
//! the [`buffer::UsageBuffer`] and published downstream in batches by a
//! [`publisher::UsagePublisher`].

pub mod buffer;
pub mod publisher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Characters per token used for pre-dispatch estimates.
const CHARS_PER_TOKEN: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Success,
    RateLimited,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub record_id: String,
    pub request_id: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    pub model: String,
    /// Backend that served the request, or the last one tried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub status: UsageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Backends attempted for this request.
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// Pre-dispatch cost estimate: payload bytes at four per token plus the
/// requested `max_tokens` when the payload is JSON and carries one.
#[must_use]
pub fn estimate_cost(payload: &[u8], cost_per_1k_tokens: f64) -> f64 {
    #[derive(Deserialize)]
    struct MaxTokens {
        max_tokens: Option<u64>,
    }

    let max_tokens = serde_json::from_slice::<MaxTokens>(payload)
        .ok()
        .and_then(|m| m.max_tokens)
        .unwrap_or(0);
    let tokens = payload.len() as u64 / CHARS_PER_TOKEN + max_tokens;
    token_cost(tokens, cost_per_1k_tokens)
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn token_cost(tokens: u64, cost_per_1k_tokens: f64) -> f64 {
    tokens as f64 / 1000.0 * cost_per_1k_tokens
}
