//! Token-bucket rate limiting.
//!
//! Buckets are refilled lazily on each acquire from a monotonic clock, so an
//! idle key costs nothing and there is no background refill task. The
//! in-memory limiter keeps one bucket per key in a [`DashMap`]; the entry lock
//! makes refill + take a single atomic step per key.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::error::ValidationError;

/// Rate limiter failures. A denial is not an error.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The cost can never be granted by a bucket this size.
    #[error("cost {cost} exceeds bucket capacity {burst}")]
    CostExceedsCapacity { cost: u32, burst: u32 },

    /// The shared backend could not be reached.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Which key a tool run is charged against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// One bucket per target value.
    #[default]
    PerTarget,
    /// A single bucket shared by every target.
    Global,
}

/// Token-bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Refill rate.
    pub tokens_per_second: f64,
    /// Bucket capacity; a new bucket starts full.
    pub burst: u32,
    /// How buckets are keyed.
    pub scope: RateLimitScope,
    /// When set (and the `redis` feature is enabled) buckets live in Redis.
    pub redis_url: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: 5.0,
            burst: 10,
            scope: RateLimitScope::PerTarget,
            redis_url: None,
        }
    }
}

impl RateLimitConfig {
    /// A cost above the bucket capacity can never be granted.
    pub fn validate_cost(
        &self,
        tool: &str,
        cost: u32,
    ) -> Result<(), ValidationError> {
        if cost > self.burst {
            return Err(ValidationError::CostExceedsBurst {
                tool: tool.to_string(),
                cost,
                burst: self.burst,
            });
        }
        Ok(())
    }

    /// The bucket a run against `target` is charged to.
    pub fn bucket_key(&self, target: &str) -> String {
        match self.scope {
            RateLimitScope::PerTarget => format!("target:{target}"),
            RateLimitScope::Global => "global".to_string(),
        }
    }
}

/// Whether tokens were taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    /// Tokens were taken.
    pub granted: bool,
    /// Time until enough tokens exist for the requested cost. `None` when
    /// granted, or when the bucket never refills.
    pub wait_hint: Option<Duration>,
}

impl RateDecision {
    /// Tokens were taken.
    pub fn granted() -> Self {
        Self {
            granted: true,
            wait_hint: None,
        }
    }

    /// Tokens were not taken.
    pub fn denied(wait_hint: Option<Duration>) -> Self {
        Self {
            granted: false,
            wait_hint,
        }
    }
}

/// Charges tool runs against token buckets. Implemented in process and,
/// with the `redis` feature, on Redis for limits shared across processes.
#[async_trait]
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Takes `cost` tokens from the bucket for `key` if they are available.
    /// A denial leaves the bucket unchanged.
    async fn try_acquire(
        &self,
        key: &str,
        cost: u32,
    ) -> Result<RateDecision, RateLimitError>;
}

/// A single bucket, refilled lazily from elapsed time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: refill_per_sec.max(0.0),
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Refills to `now`, then takes `cost` tokens if they are there.
    pub fn try_take(&mut self, cost: u32, now: Instant) -> RateDecision {
        self.refill(now);
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            return RateDecision::granted();
        }

        let wait_hint = if self.refill_per_sec > 0.0 {
            Duration::try_from_secs_f64((cost - self.tokens) / self.refill_per_sec)
                .ok()
        } else {
            None
        };
        RateDecision::denied(wait_hint)
    }

    /// Tokens left as of the last refill.
    pub fn available(&self) -> f64 {
        self.tokens
    }
}

/// Process-local limiter. Buckets are created lazily on first use.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    burst: u32,
    tokens_per_second: f64,
    buckets: DashMap<String, TokenBucket>,
}

impl InMemoryRateLimiter {
    /// A limiter with no buckets yet.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            burst: config.burst,
            tokens_per_second: config.tokens_per_second,
            buckets: DashMap::new(),
        }
    }

    /// [`RateLimiter::try_acquire`] against an explicit clock reading.
    pub fn try_acquire_at(
        &self,
        key: &str,
        cost: u32,
        now: Instant,
    ) -> Result<RateDecision, RateLimitError> {
        if cost > self.burst {
            return Err(RateLimitError::CostExceedsCapacity {
                cost,
                burst: self.burst,
            });
        }

        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| {
            TokenBucket::new(self.burst, self.tokens_per_second, now)
        });
        let decision = bucket.try_take(cost, now);

        if !decision.granted {
            tracing::trace!(
                target: "warden::policy",
                key,
                cost,
                available = bucket.available(),
                "rate limit denied"
            );
        }
        Ok(decision)
    }

    /// Tokens currently in the bucket for `key`, without refilling it.
    pub fn available(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.available())
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn try_acquire(
        &self,
        key: &str,
        cost: u32,
    ) -> Result<RateDecision, RateLimitError> {
        self.try_acquire_at(key, cost, Instant::now())
    }
}
