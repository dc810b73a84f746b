//! Token-bucket rate limiting.
//!
//! Buckets refill continuously at `rate_per_sec` up to `burst` tokens and
//! every admitted request takes one from each bucket it is subject to, or
//! from none of them. The bucket state lives in a [`RateLimitStore`]: Redis
//! for limits shared by every router instance, or process memory for a
//! single instance. Either way a bucket left idle for an hour is dropped.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub rate_per_sec: f64,
    pub burst: u32,
}

/// Buckets idle this long are forgotten, which refills them.
pub const BUCKET_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Minimum gap between idle sweeps of the in-memory store.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole tokens left in the emptiest bucket after this request.
    pub remaining: u32,
    /// Time until the denying bucket holds a whole token, if it refills.
    pub retry_after: Option<Duration>,
    /// Index into the requested keys of the first bucket without a token.
    pub denied: Option<usize>,
}

// async_trait is required here because the store is held as Arc<dyn RateLimitStore>.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Atomically refill every bucket in `keys` and take one token from each
    /// when all of them have one. A denial takes nothing from any bucket.
    async fn acquire(&self, keys: &[String], limit: RateLimit)
        -> Result<RateDecision, RouterError>;
}

pub fn org_bucket(organization_id: &str) -> String {
    format!("rate_limit:org:{organization_id}")
}

pub fn api_key_bucket(api_key_id: &str) -> String {
    format!("rate_limit:key:{api_key_id}")
}

/// Saturates at [`Duration::MAX`] when the rate is too small to express the wait.
fn retry_after(tokens: f64, rate_per_sec: f64) -> Option<Duration> {
    (rate_per_sec > 0.0).then(|| {
        Duration::try_from_secs_f64((1.0 - tokens).max(0.0) / rate_per_sec)
            .unwrap_or(Duration::MAX)
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_tokens(tokens: f64) -> u32 {
    tokens.floor().max(0.0) as u32
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, limit: RateLimit) {
        let elapsed = now.saturating_duration_since(self.refreshed).as_secs_f64();
        self.tokens = (self.tokens + elapsed * limit.rate_per_sec).min(f64::from(limit.burst));
        self.refreshed = now;
    }
}

#[derive(Debug, Default)]
struct Buckets {
    by_key: HashMap<String, Bucket>,
    last_sweep: Option<Instant>,
}

impl Buckets {
    fn evict_idle(&mut self, now: Instant) {
        if self
            .last_sweep
            .is_some_and(|at| now.saturating_duration_since(at) < SWEEP_INTERVAL)
        {
            return;
        }
        self.last_sweep = Some(now);

        let before = self.by_key.len();
        self.by_key
            .retain(|_, b| now.saturating_duration_since(b.refreshed) < BUCKET_IDLE_TTL);
        let evicted = before - self.by_key.len();
        if evicted > 0 {
            tracing::debug!(
                evicted,
                remaining = self.by_key.len(),
                "evicted idle rate-limit buckets"
            );
        }
    }
}

/// Buckets in process memory. Limits are per instance.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    buckets: Mutex<Buckets>,
}

impl MemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buckets currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_key
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(
        &self,
        keys: &[String],
        limit: RateLimit,
    ) -> Result<RateDecision, RouterError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.evict_idle(now);

        let mut denied = None;
        for (index, key) in keys.iter().enumerate() {
            let bucket = buckets.by_key.entry(key.clone()).or_insert(Bucket {
                tokens: f64::from(limit.burst),
                refreshed: now,
            });
            bucket.refill(now, limit);
            if denied.is_none() && bucket.tokens < 1.0 {
                denied = Some((index, retry_after(bucket.tokens, limit.rate_per_sec)));
            }
        }

        if let Some((index, retry_after)) = denied {
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                retry_after,
                denied: Some(index),
            });
        }

        let mut remaining = limit.burst;
        for key in keys {
            if let Some(bucket) = buckets.by_key.get_mut(key) {
                bucket.tokens -= 1.0;
                remaining = remaining.min(whole_tokens(bucket.tokens));
            }
        }
        Ok(RateDecision {
            allowed: true,
            remaining,
            retry_after: None,
            denied: None,
        })
    }
}

/// Refill every bucket, then take from all of them or none, in one
/// server-side step. Uses the server clock so instances with skewed clocks
/// share one view of time. `denied` is the 1-based index of the first empty
/// bucket, 0 when allowed.
#[cfg(feature = "redis")]
const TOKEN_BUCKET_SCRIPT: &str = r"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local levels = {}
local denied = 0
local retry_ms = -1
for i, key in ipairs(KEYS) do
  local state = redis.call('HMGET', key, 'tokens', 'ts')
  local tokens = tonumber(state[1]) or burst
  local ts = tonumber(state[2]) or now
  tokens = math.min(burst, tokens + math.max(0, now - ts) / 1000 * rate)
  levels[i] = tokens
  if denied == 0 and tokens < 1 then
    denied = i
    if rate > 0 then
      retry_ms = math.ceil((1 - tokens) / rate * 1000)
    end
  end
end
local remaining = burst
for i, key in ipairs(KEYS) do
  if denied == 0 then
    levels[i] = levels[i] - 1
  end
  remaining = math.min(remaining, math.floor(levels[i]))
  redis.call('HSET', key, 'tokens', levels[i], 'ts', now)
  redis.call('EXPIRE', key, ttl)
end
if denied > 0 then
  remaining = 0
end
return {denied == 0 and 1 or 0, remaining, retry_ms, denied}
";

#[cfg(feature = "redis")]
pub struct RedisRateLimitStore {
    connection: redis::aio::MultiplexedConnection,
    script: redis::Script,
}

#[cfg(feature = "redis")]
impl RedisRateLimitStore {
    pub async fn connect(url: &str) -> Result<Self, RouterError> {
        let client = redis::Client::open(url).map_err(|e| RouterError::RateLimitStore {
            source: Box::new(e),
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RouterError::RateLimitStore {
                source: Box::new(e),
            })?;
        Ok(Self {
            connection,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn acquire(
        &self,
        keys: &[String],
        limit: RateLimit,
    ) -> Result<RateDecision, RouterError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation
            .arg(limit.rate_per_sec)
            .arg(limit.burst)
            .arg(BUCKET_IDLE_TTL.as_secs());
        let (allowed, remaining, retry_ms, denied): (i64, i64, i64, i64) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RouterError::RateLimitStore {
                source: Box::new(e),
            })?;

        Ok(RateDecision {
            allowed: allowed == 1,
            remaining: u32::try_from(remaining.max(0)).unwrap_or(u32::MAX),
            retry_after: u64::try_from(retry_ms).ok().map(Duration::from_millis),
            denied: usize::try_from(denied - 1).ok(),
        })
    }
}
