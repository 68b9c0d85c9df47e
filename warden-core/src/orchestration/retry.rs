//! Retry budget and backoff for failed tool runs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use warden_model::ToolRunId;

use super::config::RetryConfig;

/// Exponential backoff with jitter seeded by the task key.
///
/// The same run and attempt always get the same delay; different runs that
/// fail together are spread apart.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryConfig,
    max_attempts: u16,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt and is at least 1.
    pub fn new(config: RetryConfig, max_attempts: u16) -> Self {
        Self {
            config,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Total attempts a run may make.
    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn allows_another(&self, attempts_made: u16) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failed attempts.
    pub fn delay_for(&self, key: ToolRunId, attempt: u16) -> Duration {
        let nominal = self.nominal_ms(attempt);
        Duration::from_millis(self.spread(nominal, key, attempt))
    }

    /// `backoff_base_ms * 2^(attempt - 1)`, capped at `backoff_max_ms`.
    fn nominal_ms(&self, attempt: u16) -> u64 {
        let Some(doublings) = attempt.checked_sub(1) else {
            return 0;
        };
        let factor = 1u64.checked_shl(u32::from(doublings)).unwrap_or(u64::MAX);
        self.config
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.config.backoff_max_ms)
    }

    /// Picks a point in `nominal ± window` from the key and attempt. The
    /// window is `jitter_ratio` of the nominal delay, at least
    /// `jitter_min_ms`, and the result never exceeds `backoff_max_ms`.
    fn spread(&self, nominal: u64, key: ToolRunId, attempt: u16) -> u64 {
        if nominal == 0 {
            return 0;
        }
        let ceiling = self.config.backoff_max_ms;
        let ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let window = ((nominal as f64 * ratio) as u64)
            .max(self.config.jitter_min_ms)
            .min(ceiling);

        let low = nominal.saturating_sub(window);
        let high = nominal.saturating_add(window).min(ceiling);
        if high <= low {
            return low;
        }
        low + jitter_seed(key, attempt) % (high - low).saturating_add(1)
    }
}

fn jitter_seed(key: ToolRunId, attempt: u16) -> u64 {
    let mut hasher = DefaultHasher::new();
    (key, attempt).hash(&mut hasher);
    hasher.finish()
}
