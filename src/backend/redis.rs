//! Redis rate limit backend.
//!
//! Uses Redis for distributed rate limiting across multiple instances.
//! Every state-advancing operation is a single Lua script invocation, so
//! the read-modify-write is atomic server-side and idempotent under retry.
//! Connections come from a bb8 pool; each call is bounded by a per-call
//! timeout and the pool wait is bounded separately.
//!
//! Requires the `redis` feature to be enabled.

use crate::algorithms::Algorithm;
use crate::backend::{
    FixedWindowSnapshot, PeekSnapshot, RateLimitBackend, SlidingWindowSnapshot,
    TokenBucketSnapshot,
};
use crate::clock::Clock;
use crate::error::{RateLimitError, RateLimitResult};
use async_trait::async_trait;
use bb8_redis::bb8::{Pool, RunError};
use bb8_redis::RedisConnectionManager;
use rand::RngCore;
use redis::aio::MultiplexedConnection;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Script revision. Scripts are addressed by their SHA server-side; this
/// tag marks incompatible state layouts. No migration is performed for
/// keys written by an older revision; operators flush on upgrade.
pub const SCRIPT_VERSION: &str = "v1";

/// Fixed window: INCR, set the TTL on first increment, report count and
/// remaining window.
const FIXED_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Sliding window: prune, count, conditionally admit, refresh TTL, report
/// the oldest surviving timestamp.
const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[2])
local count = redis.call('ZCARD', KEYS[1])
local admitted = 0
if count < tonumber(ARGV[1]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    count = count + 1
    admitted = 1
end
redis.call('PEXPIRE', KEYS[1], ARGV[5])
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local reset = tonumber(ARGV[3])
if oldest[2] then
    reset = tonumber(oldest[2])
end
return {admitted, count, reset}
"#;

/// Token bucket: refill for the elapsed time (resetting to full after a
/// long idle gap), consume if possible, write back.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local data = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(data[1])
local last_refill = tonumber(data[2])
if tokens == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = (now - last_refill) / 1000.0
if elapsed > 2 * capacity / refill_rate then
    tokens = capacity
else
    tokens = math.min(capacity, tokens + elapsed * refill_rate)
end

local admitted = 0
if tokens >= cost then
    tokens = tokens - cost
    admitted = 1
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', now,
           'capacity', capacity, 'refill_rate', refill_rate)
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {admitted, tostring(tokens)}
"#;

/// Read-only bucket inspection; the refill is recomputed client-side.
const PEEK_BUCKET_SCRIPT: &str = r#"
local data = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill', 'capacity', 'refill_rate')
return {data[1] or '', data[2] or '', data[3] or '', data[4] or ''}
"#;

/// Configuration for the Redis backend.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RedisBackendConfig {
    /// Redis connection URL (`redis://host:port`).
    pub url: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Per-call timeout covering the script round-trip.
    pub timeout: Duration,
    /// How long a caller may wait for a free pooled connection.
    pub pool_wait_timeout: Duration,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            timeout: Duration::from_millis(100),
            pool_wait_timeout: Duration::from_millis(50),
        }
    }
}

impl RedisBackendConfig {
    /// Configuration for the given URL with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Redis-backed rate limit backend.
pub struct RedisBackend {
    pool: Pool<RedisConnectionManager>,
    config: RedisBackendConfig,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
    name: String,
}

impl RedisBackend {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn new(
        config: RedisBackendConfig,
        clock: Arc<dyn Clock>,
    ) -> RateLimitResult<Arc<Self>> {
        debug!(url = %config.url, pool_size = config.pool_size, "Connecting to Redis for rate limiting");

        let manager = RedisConnectionManager::new(config.url.clone())
            .map_err(|e| RateLimitError::fatal(format!("invalid Redis URL: {e}")))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.pool_wait_timeout.max(Duration::from_millis(1)))
            .build(manager)
            .await
            .map_err(|e| RateLimitError::transient(format!("Redis pool build failed: {e}")))?;

        let backend = Arc::new(Self {
            pool,
            config,
            clock,
            closed: AtomicBool::new(false),
            name: "redis".to_string(),
        });
        backend.probe().await?;

        info!(
            pool_size = backend.config.pool_size,
            script_version = SCRIPT_VERSION,
            "Redis rate limit backend ready"
        );
        Ok(backend)
    }

    fn ensure_open(&self) -> RateLimitResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RateLimitError::Closed)
        } else {
            Ok(())
        }
    }

    /// Check out a pooled connection. The multiplexed handle is cloned out
    /// of the pool guard so call futures own it outright.
    async fn connection(&self) -> RateLimitResult<MultiplexedConnection> {
        self.ensure_open()?;
        let pooled = self.pool.get().await.map_err(|e| match e {
            RunError::TimedOut => {
                RateLimitError::transient("timed out waiting for a pooled Redis connection")
            }
            RunError::User(err) => classify(err),
        })?;
        Ok((*pooled).clone())
    }

    /// Await one Redis round-trip under the per-call timeout.
    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, redis::RedisError>>,
    ) -> RateLimitResult<T> {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(RateLimitError::transient(format!(
                "Redis call exceeded {:?}",
                self.config.timeout
            ))),
        }
    }
}

/// Network-shaped errors are transient and feed the circuit with weight 1;
/// protocol and script errors are fatal and count double.
fn classify(err: redis::RedisError) -> RateLimitError {
    if err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.kind() == redis::ErrorKind::IoError
    {
        RateLimitError::transient(err.to_string())
    } else {
        RateLimitError::fatal(err.to_string())
    }
}

fn sliding_member(now_ms: u64) -> String {
    // 96-bit nonce disambiguates concurrent inserts at the same
    // millisecond; the score alone is not unique.
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    format!("{now_ms}-{}", hex::encode(nonce))
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    async fn incr_fixed(
        &self,
        key: &str,
        period: Duration,
        align_to_clock: bool,
    ) -> RateLimitResult<FixedWindowSnapshot> {
        let now_ms = self.clock.now_millis();
        let period_ms = period.as_millis() as u64;
        // A brand-new aligned window expires at the next clock boundary;
        // an unaligned one lives a full period from first arrival.
        let initial_ttl_ms = if align_to_clock {
            period_ms - (now_ms % period_ms)
        } else {
            period_ms
        };

        let mut conn = self.connection().await?;
        let script = redis::Script::new(FIXED_WINDOW_SCRIPT);
        let (count, pttl): (u64, i64) = self
            .with_timeout(script.key(key).arg(initial_ttl_ms).invoke_async(&mut conn))
            .await?;

        let reset_at = (now_ms + pttl.max(0) as u64).div_ceil(1000);
        trace!(key = %key, count, reset_at, "Redis fixed window increment");
        Ok(FixedWindowSnapshot { count, reset_at })
    }

    async fn check_sliding(
        &self,
        key: &str,
        period: Duration,
        limit: u64,
        now_ms: u64,
    ) -> RateLimitResult<SlidingWindowSnapshot> {
        let period_ms = period.as_millis() as u64;
        let cutoff = now_ms.saturating_sub(period_ms);
        let member = sliding_member(now_ms);

        let mut conn = self.connection().await?;
        let script = redis::Script::new(SLIDING_WINDOW_SCRIPT);
        let (admitted, count, oldest_ms): (u8, u64, u64) = self
            .with_timeout(
                script
                    .key(key)
                    .arg(limit)
                    .arg(cutoff)
                    .arg(now_ms)
                    .arg(member)
                    .arg(period_ms)
                    .invoke_async(&mut conn),
            )
            .await?;

        let snapshot = SlidingWindowSnapshot {
            count,
            reset_at: (oldest_ms + period_ms).div_ceil(1000),
            admitted: admitted == 1,
        };
        trace!(key = %key, count, admitted = snapshot.admitted, "Redis sliding window check");
        Ok(snapshot)
    }

    async fn check_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_rate: f64,
        period: Duration,
        now_ms: u64,
        cost: f64,
    ) -> RateLimitResult<TokenBucketSnapshot> {
        // Keys live ceil(capacity / refill_rate) + period past the last
        // touch.
        let ttl_ms = (capacity as f64 / refill_rate).ceil() as u64 * 1000
            + period.as_millis() as u64;

        let mut conn = self.connection().await?;
        let script = redis::Script::new(TOKEN_BUCKET_SCRIPT);
        let (admitted, tokens_repr): (u8, String) = self
            .with_timeout(
                script
                    .key(key)
                    .arg(capacity)
                    .arg(refill_rate)
                    .arg(now_ms)
                    .arg(cost)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn),
            )
            .await?;

        let tokens: f64 = tokens_repr.parse().map_err(|_| {
            RateLimitError::fatal(format!("bucket script returned bad token count: {tokens_repr:?}"))
        })?;
        let snapshot = TokenBucketSnapshot {
            tokens,
            reset_at: now_ms / 1000 + (((capacity as f64 - tokens) / refill_rate).ceil() as u64),
            admitted: admitted == 1,
        };
        trace!(key = %key, tokens, admitted = snapshot.admitted, "Redis token bucket check");
        Ok(snapshot)
    }

    async fn peek(&self, key: &str, algorithm: Algorithm) -> RateLimitResult<PeekSnapshot> {
        let now_ms = self.clock.now_millis();
        let now_secs = now_ms / 1000;

        let mut conn = self.connection().await?;
        match algorithm {
            Algorithm::FixedWindow => {
                let (count, pttl): (Option<u64>, i64) = self
                    .with_timeout(
                        redis::pipe()
                            .atomic()
                            .get(key)
                            .cmd("PTTL")
                            .arg(key)
                            .query_async(&mut conn),
                    )
                    .await?;
                Ok(PeekSnapshot {
                    level: count.unwrap_or(0) as f64,
                    reset_at: now_secs + pttl.max(0) as u64 / 1000,
                })
            }
            Algorithm::SlidingWindow => {
                let (count, pttl): (u64, i64) = self
                    .with_timeout(
                        redis::pipe()
                            .atomic()
                            .zcard(key)
                            .cmd("PTTL")
                            .arg(key)
                            .query_async(&mut conn),
                    )
                    .await?;
                Ok(PeekSnapshot {
                    level: count as f64,
                    reset_at: now_secs + pttl.max(0) as u64 / 1000,
                })
            }
            Algorithm::TokenBucket => {
                let script = redis::Script::new(PEEK_BUCKET_SCRIPT);
                let fields: Vec<String> = self
                    .with_timeout(script.key(key).invoke_async(&mut conn))
                    .await?;

                let tokens: Option<f64> = fields.first().and_then(|s| s.parse().ok());
                let last_refill: Option<u64> = fields.get(1).and_then(|s| s.parse().ok());
                let capacity: Option<f64> = fields.get(2).and_then(|s| s.parse().ok());
                let refill_rate: Option<f64> = fields.get(3).and_then(|s| s.parse().ok());

                match (tokens, last_refill, capacity, refill_rate) {
                    (Some(tokens), Some(last_refill), Some(capacity), Some(rate))
                        if rate > 0.0 =>
                    {
                        let elapsed = now_ms.saturating_sub(last_refill) as f64 / 1000.0;
                        let level = (tokens + elapsed * rate).min(capacity);
                        Ok(PeekSnapshot {
                            level,
                            reset_at: now_secs + (((capacity - level) / rate).ceil() as u64),
                        })
                    }
                    _ => Ok(PeekSnapshot {
                        level: 0.0,
                        reset_at: now_secs,
                    }),
                }
            }
        }
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        debug!(key = %key, "Resetting rate limit state in Redis");
        let mut conn = self.connection().await?;
        let _: () = self
            .with_timeout(redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn probe(&self) -> RateLimitResult<()> {
        let mut conn = self.connection().await?;
        let pong: String = self
            .with_timeout(redis::cmd("PING").query_async(&mut conn))
            .await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(RateLimitError::fatal(format!("unexpected PING reply: {pong:?}")))
        }
    }

    async fn close(&self) -> RateLimitResult<()> {
        debug!("Closing Redis rate limit backend");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("url", &self.config.url)
            .field("pool_size", &self.config.pool_size)
            .field("timeout", &self.config.timeout)
            .finish()
    }
}
