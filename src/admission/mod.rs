//! Admission control: rate limit first, then the budget check.
//!
//! Both gates run before any policy lookup or backend call. Rejections are
//! returned as [`DispatchError`]s. Infrastructure failures in either gate
//! (rate-limit store down, budget service slow or erroring) admit the
//! request and are logged; overage is left to asynchronous reconciliation.

pub mod budget;
pub mod rate_limiter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::DispatchError;
use crate::registry::saturating_millis;
use budget::{BudgetOracle, BudgetVerdict};
use rate_limiter::{api_key_bucket, org_bucket, RateLimit, RateLimitStore};

/// Bound on every rate-limit store call.
const RATE_LIMIT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Times a gate was skipped because its dependency failed.
#[derive(Debug, Default)]
pub struct AdmissionStats {
    pub rate_limit_fail_open: AtomicU64,
    pub budget_fail_open: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdmissionStatsView {
    pub rate_limit_fail_open: u64,
    pub budget_fail_open: u64,
}

pub struct AdmissionController {
    limiter: Arc<dyn RateLimitStore>,
    limit: RateLimit,
    budget: Arc<dyn BudgetOracle>,
    budget_timeout: Duration,
    stats: AdmissionStats,
}

impl AdmissionController {
    #[must_use]
    pub fn new(
        limiter: Arc<dyn RateLimitStore>,
        limit: RateLimit,
        budget: Arc<dyn BudgetOracle>,
        budget_timeout: Duration,
    ) -> Self {
        Self {
            limiter,
            limit,
            budget,
            budget_timeout,
            stats: AdmissionStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> AdmissionStatsView {
        AdmissionStatsView {
            rate_limit_fail_open: self.stats.rate_limit_fail_open.load(Ordering::Relaxed),
            budget_fail_open: self.stats.budget_fail_open.load(Ordering::Relaxed),
        }
    }

    pub async fn admit(
        &self,
        organization_id: &str,
        api_key_id: Option<&str>,
        estimated_cost: f64,
    ) -> Result<(), DispatchError> {
        self.check_rate_limit(organization_id, api_key_id).await?;
        self.check_budget(organization_id, estimated_cost).await
    }

    async fn check_rate_limit(
        &self,
        organization_id: &str,
        api_key_id: Option<&str>,
    ) -> Result<(), DispatchError> {
        let mut scopes = vec![format!("organization '{organization_id}'")];
        let mut buckets = vec![org_bucket(organization_id)];
        if let Some(key) = api_key_id {
            scopes.push(format!("api key '{key}'"));
            buckets.push(api_key_bucket(key));
        }

        // One call for every bucket, so a denial charges none of them.
        let acquired = tokio::time::timeout(
            RATE_LIMIT_STORE_TIMEOUT,
            self.limiter.acquire(&buckets, self.limit),
        )
        .await;
        match acquired {
            Ok(Ok(decision)) if decision.allowed => Ok(()),
            Ok(Ok(decision)) => {
                let index = decision.denied.unwrap_or(0).min(buckets.len() - 1);
                tracing::info!(
                    organization_id,
                    bucket = %buckets[index],
                    retry_after_ms = decision.retry_after.map(saturating_millis),
                    "rate limit exceeded"
                );
                Err(DispatchError::RateLimited {
                    scope: scopes.swap_remove(index),
                    retry_after: decision.retry_after,
                })
            }
            Ok(Err(e)) => {
                self.stats.rate_limit_fail_open.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    organization_id,
                    store = self.limiter.name(),
                    error = %e,
                    "rate limit store failed, admitting request"
                );
                Ok(())
            }
            Err(_) => {
                self.stats.rate_limit_fail_open.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    organization_id,
                    store = self.limiter.name(),
                    timeout = ?RATE_LIMIT_STORE_TIMEOUT,
                    "rate limit store timed out, admitting request"
                );
                Ok(())
            }
        }
    }

    async fn check_budget(
        &self,
        organization_id: &str,
        estimated_cost: f64,
    ) -> Result<(), DispatchError> {
        let checked = tokio::time::timeout(
            self.budget_timeout,
            self.budget.check(organization_id, estimated_cost),
        )
        .await;
        match checked {
            Ok(Ok(BudgetVerdict::Allowed)) => Ok(()),
            Ok(Ok(BudgetVerdict::Denied { reason })) => {
                tracing::info!(
                    organization_id,
                    estimated_cost,
                    reason = %reason,
                    "budget denied"
                );
                Err(DispatchError::BudgetDenied {
                    organization_id: organization_id.to_string(),
                    reason,
                })
            }
            Ok(Err(e)) => {
                self.stats.budget_fail_open.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    organization_id,
                    error = %e,
                    "budget check failed, admitting request"
                );
                Ok(())
            }
            Err(_) => {
                self.stats.budget_fail_open.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    organization_id,
                    timeout = ?self.budget_timeout,
                    "budget check timed out, admitting request"
                );
                Ok(())
            }
        }
    }
}
