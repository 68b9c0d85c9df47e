//! Redis-backed token buckets, shared by every orchestrator process that
//! points at the same server. The refill + take step runs as one Lua script,
//! so it is atomic per key on the server side.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use super::rate_limit::{
    RateDecision, RateLimitConfig, RateLimitError, RateLimiter,
};

const KEY_PREFIX: &str = "warden:rate";

fn token_bucket_script() -> Script {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local rate = tonumber(ARGV[2])
        local capacity = tonumber(ARGV[3])
        local requested = tonumber(ARGV[4]) or 1

        local bucket = redis.call('HMGET', key, 'tokens', 'last_update')
        local tokens = tonumber(bucket[1]) or capacity
        local last_update = tonumber(bucket[2]) or now

        local elapsed = math.max(0, now - last_update) / 1000.0
        tokens = math.min(capacity, tokens + elapsed * rate)

        if tokens >= requested then
            tokens = tokens - requested
            redis.call('HSET', key, 'tokens', tostring(tokens), 'last_update', now)
            if rate > 0 then
                redis.call('PEXPIRE', key, math.ceil(capacity / rate * 1000))
            end
            return {1, 0}
        end

        if rate <= 0 then
            return {0, -1}
        end
        return {0, math.ceil((requested - tokens) / rate * 1000)}
        "#,
    )
}

/// Token buckets kept in Redis and updated by a Lua script.
pub struct RedisRateLimiter {
    redis: ConnectionManager,
    script: Script,
    burst: u32,
    tokens_per_second: f64,
}

impl fmt::Debug for RedisRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisRateLimiter")
            .field("burst", &self.burst)
            .field("tokens_per_second", &self.tokens_per_second)
            .finish_non_exhaustive()
    }
}

impl RedisRateLimiter {
    /// Connects to `redis_url` and uses `config` for every bucket.
    pub async fn connect(
        redis_url: &str,
        config: &RateLimitConfig,
    ) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| RateLimitError::Backend(err.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|err| RateLimitError::Backend(err.to_string()))?;

        tracing::info!(
            target: "warden::policy",
            burst = config.burst,
            tokens_per_second = config.tokens_per_second,
            "using redis token buckets"
        );

        Ok(Self {
            redis,
            script: token_bucket_script(),
            burst: config.burst,
            tokens_per_second: config.tokens_per_second,
        })
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_acquire(
        &self,
        key: &str,
        cost: u32,
    ) -> Result<RateDecision, RateLimitError> {
        if cost > self.burst {
            return Err(RateLimitError::CostExceedsCapacity {
                cost,
                burst: self.burst,
            });
        }

        // Wall clock: buckets are shared between processes.
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut conn = self.redis.clone();
        let (granted, wait_ms): (i64, i64) = self
            .script
            .key(format!("{KEY_PREFIX}:{key}"))
            .arg(now_ms)
            .arg(self.tokens_per_second)
            .arg(self.burst)
            .arg(cost)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| RateLimitError::Backend(err.to_string()))?;

        if granted == 1 {
            return Ok(RateDecision::granted());
        }
        let wait_hint = u64::try_from(wait_ms).ok().map(Duration::from_millis);
        Ok(RateDecision::denied(wait_hint))
    }
}
