//! Downstream usage pipelines.
//!
//! A [`UsagePublisher`] takes one batch of records and either accepts all
//! of them or fails; the buffer keeps the batch queued on failure.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::Method;

use super::UsageRecord;
use crate::error::RouterError;
use crate::server::HttpClient;

// async_trait is required here because the publisher is held as Arc<dyn UsagePublisher>.
#[async_trait]
pub trait UsagePublisher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, records: &[UsageRecord]) -> Result<(), RouterError>;
}

/// POSTs each batch as a JSON array.
pub struct HttpPublisher {
    client: HttpClient,
    url: String,
}

impl HttpPublisher {
    #[must_use]
    pub fn new(client: HttpClient, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

fn publish_failed(
    publisher: &'static str,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> RouterError {
    RouterError::DownstreamPublishFailed {
        publisher,
        source: source.into(),
    }
}

#[async_trait]
impl UsagePublisher for HttpPublisher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(&self, records: &[UsageRecord]) -> Result<(), RouterError> {
        let body = serde_json::to_vec(records)?;
        let req = hyper::Request::builder()
            .method(Method::POST)
            .uri(self.url.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| publish_failed("http", e))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| publish_failed("http", e))?;
        let status = response.status();
        // Drain the body so the connection returns to the pool.
        let _ = response.into_body().collect().await;

        if status.is_success() {
            Ok(())
        } else {
            Err(publish_failed("http", format!("pipeline returned status {status}")))
        }
    }
}

/// Appends one stream entry per record with `XADD`, all in one
/// transaction.
#[cfg(feature = "redis")]
pub struct RedisStreamPublisher {
    connection: redis::aio::MultiplexedConnection,
    stream: String,
}

#[cfg(feature = "redis")]
impl RedisStreamPublisher {
    pub async fn connect(url: &str, stream: impl Into<String>) -> Result<Self, RouterError> {
        let client = redis::Client::open(url).map_err(|e| publish_failed("redis-stream", e))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| publish_failed("redis-stream", e))?;
        Ok(Self {
            connection,
            stream: stream.into(),
        })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl UsagePublisher for RedisStreamPublisher {
    fn name(&self) -> &'static str {
        "redis-stream"
    }

    async fn publish(&self, records: &[UsageRecord]) -> Result<(), RouterError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in records {
            let payload = serde_json::to_string(record)?;
            pipe.xadd(
                &self.stream,
                "*",
                &[
                    ("record_id", record.record_id.as_str()),
                    ("organization_id", record.organization_id.as_str()),
                    ("model", record.model.as_str()),
                    ("payload", payload.as_str()),
                ],
            )
            .ignore();
        }

        let mut conn = self.connection.clone();
        let () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| publish_failed("redis-stream", e))?;
        Ok(())
    }
}

/// Emits records to the log. Used when no pipeline is configured.
#[derive(Debug, Default)]
pub struct TracingPublisher {
    published: AtomicU64,
}

impl TracingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UsagePublisher for TracingPublisher {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn publish(&self, records: &[UsageRecord]) -> Result<(), RouterError> {
        for record in records {
            tracing::info!(
                target: "usage",
                record_id = %record.record_id,
                request_id = %record.request_id,
                organization_id = %record.organization_id,
                model = %record.model,
                backend_id = record.backend_id.as_deref().unwrap_or("-"),
                status = ?record.status,
                error_code = record.error_code.as_deref().unwrap_or("-"),
                tokens_input = record.tokens_input,
                tokens_output = record.tokens_output,
                latency_ms = record.latency_ms,
                cost_usd = record.cost_usd,
                "usage record"
            );
        }
        self.published
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}
