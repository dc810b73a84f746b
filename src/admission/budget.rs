//! Budget oracle clients.
//!
//! The router only asks whether an organization may spend an estimated
//! amount; budget computation lives in the budget service.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RouterError;
use crate::server::HttpClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetVerdict {
    Allowed,
    Denied { reason: String },
}

// async_trait is required here because the oracle is held as Arc<dyn BudgetOracle>.
#[async_trait]
pub trait BudgetOracle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        organization_id: &str,
        estimated_cost: f64,
    ) -> Result<BudgetVerdict, RouterError>;
}

/// Used when no budget service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllBudget;

#[async_trait]
impl BudgetOracle for AllowAllBudget {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn check(&self, _: &str, _: f64) -> Result<BudgetVerdict, RouterError> {
        Ok(BudgetVerdict::Allowed)
    }
}

#[derive(Serialize)]
struct CheckRequest {
    estimated_cost: f64,
}

#[derive(Deserialize)]
struct CheckResponse {
    allowed: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// `POST {endpoint}/v1/budgets/{org}/check`.
pub struct HttpBudgetOracle {
    client: HttpClient,
    endpoint: Url,
}

impl HttpBudgetOracle {
    pub fn new(client: HttpClient, endpoint: &str) -> Result<Self, RouterError> {
        let endpoint = Url::parse(endpoint).map_err(|e| RouterError::UriParse {
            source: Box::new(e),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(RouterError::UriParse {
                source: format!("budget endpoint '{endpoint}' cannot be a base URL").into(),
            });
        }
        Ok(Self { client, endpoint })
    }

    fn check_url(&self, organization_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "budgets", organization_id, "check"]);
        }
        url
    }
}

fn request_failed(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> RouterError {
    RouterError::HttpRequest {
        source: source.into(),
    }
}

#[async_trait]
impl BudgetOracle for HttpBudgetOracle {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn check(
        &self,
        organization_id: &str,
        estimated_cost: f64,
    ) -> Result<BudgetVerdict, RouterError> {
        let body = serde_json::to_vec(&CheckRequest { estimated_cost })?;
        let req = hyper::Request::builder()
            .method(Method::POST)
            .uri(self.check_url(organization_id).as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(request_failed)?;

        let response = self.client.request(req).await.map_err(request_failed)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(request_failed)?
            .to_bytes();

        if !status.is_success() {
            return Err(request_failed(format!("budget service returned status {status}")));
        }

        let reply: CheckResponse = serde_json::from_slice(&body)?;
        Ok(if reply.allowed {
            BudgetVerdict::Allowed
        } else {
            BudgetVerdict::Denied {
                reason: reply
                    .reason
                    .unwrap_or_else(|| "budget exhausted".to_string()),
            }
        })
    }
}
