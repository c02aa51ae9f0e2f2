use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::services::clock::add_duration;

const KEY_PREFIX: &str = "meal_zone_guard:rl";
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// Atomic check-and-increment of a fixed window counter.
///
/// Returns `{allowed, count, ttl_ms}`. A key with no TTL or a lapsed window is
/// replaced rather than incremented; a full window is reported without
/// incrementing.
const WINDOW_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
local limit = tonumber(ARGV[1])
if current and ttl > 0 then
  current = tonumber(current)
  if current >= limit then
    return {0, current, ttl}
  end
  local count = redis.call('INCR', KEYS[1])
  return {1, count, ttl}
end
if limit < 1 then
  return {0, 0, tonumber(ARGV[2])}
end
redis.call('SET', KEYS[1], 1, 'PX', ARGV[2])
return {1, 1, tonumber(ARGV[2])}
"#;

/// State of one `(identifier, class)` window after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub allowed: bool,
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Result of asking the shared store; unavailability is a value, not a panic
/// path, so the limiter's fallback is an explicit branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Counted(WindowState),
    Unavailable(String),
}

/// Shared, cross-instance counter store used by the rate limiter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Count one request against `key` unless the live window is full.
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreOutcome;

    /// Connectivity check used by the health endpoint.
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Redis-backed counter store.
pub struct RedisCounterStore {
    client: redis::Client,
    script: redis::Script,
    timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(StoreError::Redis)?;
        Ok(Self {
            client,
            script: redis::Script::new(WINDOW_SCRIPT),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    async fn try_hit(&self, key: &str, limit: u32, window: Duration) -> Result<(i64, i64, i64), StoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?;
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: (i64, i64, i64) = self
            .script
            .key(format!("{KEY_PREFIX}:{key}"))
            .arg(limit)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::Redis)?;
        Ok(reply)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreOutcome {
        match tokio::time::timeout(self.timeout, self.try_hit(key, limit, window)).await {
            Ok(Ok((allowed, count, ttl_ms))) => StoreOutcome::Counted(WindowState {
                allowed: allowed == 1,
                count: u32::try_from(count.max(0)).unwrap_or(u32::MAX),
                reset_at: add_duration(now, Duration::from_millis(ttl_ms.max(0) as u64)),
            }),
            Ok(Err(e)) => StoreOutcome::Unavailable(e.to_string()),
            Err(_) => StoreOutcome::Unavailable(StoreError::Timeout(self.timeout).to_string()),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(StoreError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter store did not answer within {0:?}")]
    Timeout(Duration),
}
