//! Outbound calls to inference backends.
//!
//! [`BackendTransport`] is the seam between the dispatcher and the network:
//! one request/response call per attempt and one health probe per backend.
//! [`HyperTransport`] implements it over the shared pooled hyper client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use serde::Deserialize;

use crate::registry::BackendEndpoint;
use crate::server::HttpClient;

/// What the dispatcher sends on every attempt.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub request_id: String,
    pub organization_id: String,
    pub model: String,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct BackendReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub latency: Duration,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendFailure {
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned status {0}")]
    Status(StatusCode),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// async_trait is required here because the transport is held as Arc<dyn BackendTransport>.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// One call against `endpoint`, bounded by its timeout. Transport errors,
    /// timeouts and non-2xx statuses are failures.
    async fn invoke(
        &self,
        endpoint: &BackendEndpoint,
        request: &BackendRequest,
    ) -> Result<BackendReply, BackendFailure>;

    /// `GET {uri}/health`; any 2xx is healthy.
    async fn probe(
        &self,
        endpoint: &BackendEndpoint,
        timeout: Duration,
    ) -> Result<(), BackendFailure>;
}

pub struct HyperTransport {
    client: HttpClient,
}

impl HyperTransport {
    #[must_use]
    pub const fn new(client: HttpClient) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        req: hyper::Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<BackendReply, BackendFailure> {
        let start = Instant::now();
        let response = tokio::time::timeout(timeout, async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| BackendFailure::Transport(e.to_string()))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| BackendFailure::Transport(format!("body read error: {e}")))?
                .to_bytes();
            Ok::<_, BackendFailure>((status, headers, body))
        })
        .await
        .map_err(|_| BackendFailure::Timeout(timeout))??;

        let (status, headers, body) = response;
        if !status.is_success() {
            return Err(BackendFailure::Status(status));
        }
        Ok(BackendReply {
            status,
            headers,
            body,
            latency: start.elapsed(),
        })
    }
}

#[async_trait]
impl BackendTransport for HyperTransport {
    async fn invoke(
        &self,
        endpoint: &BackendEndpoint,
        request: &BackendRequest,
    ) -> Result<BackendReply, BackendFailure> {
        let mut builder = hyper::Request::builder()
            .method(Method::POST)
            .uri(endpoint.uri.as_str())
            .header("x-request-id", &request.request_id)
            .header("x-organization-id", &request.organization_id)
            .header("x-model", &request.model);
        builder = builder.header(
            CONTENT_TYPE,
            request
                .content_type
                .clone()
                .unwrap_or_else(|| HeaderValue::from_static("application/json")),
        );

        let req = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| BackendFailure::InvalidRequest(e.to_string()))?;
        self.send(req, endpoint.timeout).await
    }

    async fn probe(
        &self,
        endpoint: &BackendEndpoint,
        timeout: Duration,
    ) -> Result<(), BackendFailure> {
        let req = hyper::Request::builder()
            .method(Method::GET)
            .uri(endpoint.join("health"))
            .body(Full::new(Bytes::new()))
            .map_err(|e| BackendFailure::InvalidRequest(e.to_string()))?;
        self.send(req, timeout).await.map(|_| ())
    }
}

/// Token counts reported by a backend, when it reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input + self.output
    }

    /// Best-effort read of `usage.prompt_tokens`/`usage.completion_tokens`,
    /// or a flat `tokens_used`, from a JSON reply body.
    #[must_use]
    pub fn from_reply(body: &[u8]) -> Option<Self> {
        #[derive(Deserialize)]
        struct Usage {
            #[serde(default)]
            prompt_tokens: u64,
            #[serde(default)]
            completion_tokens: u64,
        }
        #[derive(Deserialize)]
        struct Reply {
            usage: Option<Usage>,
            tokens_used: Option<u64>,
        }

        let reply: Reply = serde_json::from_slice(body).ok()?;
        match (reply.usage, reply.tokens_used) {
            (Some(u), _) => Some(Self {
                input: u.prompt_tokens,
                output: u.completion_tokens,
            }),
            (None, Some(total)) => Some(Self {
                input: 0,
                output: total,
            }),
            (None, None) => None,
        }
    }
}
