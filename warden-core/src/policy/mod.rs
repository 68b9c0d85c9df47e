//! Admission control.
//!
//! Every check here is synchronous and non-blocking from the caller's point
//! of view: a denial is returned immediately with a reason, never by waiting
//! for capacity.

pub mod concurrency;
pub mod engine;
pub mod network;
pub mod rate_limit;
#[cfg(feature = "redis")]
pub mod redis_rate_limit;
pub mod tools;

pub use concurrency::{
    ConcurrencyConfig, ConcurrencyError, ConcurrencySnapshot,
    ConcurrencyTracker, CounterKind, JobSlot, ToolSlots,
};
pub use engine::{Admission, AdmissionPermit, PolicyConfig, PolicyEngine};
pub use network::{
    NetworkAuthorizer, NetworkPolicyConfig, NetworkRule, NetworkVerdict,
};
pub use rate_limit::{
    InMemoryRateLimiter, RateDecision, RateLimitConfig, RateLimitError,
    RateLimitScope, RateLimiter, TokenBucket,
};
#[cfg(feature = "redis")]
pub use redis_rate_limit::RedisRateLimiter;
pub use tools::{ToolAuthorizer, ToolPolicyConfig, ToolVerdict};

use thiserror::Error;

/// Invalid policy configuration detected while building authorizers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// A network rule that does not parse.
    #[error("invalid network rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    /// A limit outside its valid range.
    #[error("invalid policy setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}
