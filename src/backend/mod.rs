//! Rate limit storage backends.
//!
//! This module provides the storage contract and the built-in drivers:
//!
//! - **Memory**: in-process storage with TTL expiry, an LRU cap and a
//!   background cleanup task (default, single-instance)
//! - **Redis**: distributed storage using atomic Lua scripts
//! - **Multi**: an ordered list of backends with circuit breakers and
//!   health-aware failover

mod memory;
pub mod multi;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{MemoryBackend, MemoryBackendConfig};
pub use multi::{MultiBackend, MultiStrategy};
#[cfg(feature = "redis")]
pub use redis::{RedisBackend, RedisBackendConfig};

use crate::algorithms::Algorithm;
use crate::error::RateLimitResult;
use async_trait::async_trait;
use std::time::Duration;

/// Result of a fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowSnapshot {
    /// Counter value after the increment.
    pub count: u64,
    /// When the current window expires (epoch seconds).
    pub reset_at: u64,
}

/// Result of a sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowSnapshot {
    /// Live entries after the check (including this request when admitted).
    pub count: u64,
    /// When the oldest live entry falls out of the window (epoch seconds).
    pub reset_at: u64,
    /// Whether the request was admitted.
    pub admitted: bool,
}

/// Result of a token-bucket check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketSnapshot {
    /// Tokens left after the check.
    pub tokens: f64,
    /// When the bucket returns to full (epoch seconds).
    pub reset_at: u64,
    /// Whether the request was admitted.
    pub admitted: bool,
}

/// Read-only view of a key's current state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeekSnapshot {
    /// Current count (fixed/sliding) or token level (bucket).
    pub level: f64,
    /// When the state expires or refills (epoch seconds).
    pub reset_at: u64,
}

/// Storage contract implemented by every backend.
///
/// Each operation is atomic with respect to concurrent callers observing
/// the same key and returns within the backend's configured timeout. The
/// memory driver serializes per key through its map's entry locks; the
/// Redis driver executes a single server-side script per operation.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Atomically increment the fixed-window counter for `key`, creating
    /// the window on first access. The window start is clock-aligned when
    /// `align_to_clock` is set, otherwise the first request's arrival time.
    async fn incr_fixed(
        &self,
        key: &str,
        period: Duration,
        align_to_clock: bool,
    ) -> RateLimitResult<FixedWindowSnapshot>;

    /// Atomically prune entries older than `now - period`, then admit and
    /// record this request iff fewer than `limit` remain.
    async fn check_sliding(
        &self,
        key: &str,
        period: Duration,
        limit: u64,
        now_ms: u64,
    ) -> RateLimitResult<SlidingWindowSnapshot>;

    /// Atomically refill the bucket for the elapsed time, then consume
    /// `cost` tokens iff available. The written-back state lives for
    /// `ceil(capacity / refill_rate) + period`.
    async fn check_bucket(
        &self,
        key: &str,
        capacity: u64,
        refill_rate: f64,
        period: Duration,
        now_ms: u64,
        cost: f64,
    ) -> RateLimitResult<TokenBucketSnapshot>;

    /// Read the current state for `key` without mutating anything a
    /// subsequent call could observe.
    async fn peek(&self, key: &str, algorithm: Algorithm) -> RateLimitResult<PeekSnapshot>;

    /// Erase all state for `key`.
    async fn reset(&self, key: &str) -> RateLimitResult<()>;

    /// Lightweight health check; succeeds iff the backend can accept a new
    /// call.
    async fn probe(&self) -> RateLimitResult<()>;

    /// Begin teardown. In-flight operations complete; new operations fail
    /// with [`crate::RateLimitError::Closed`].
    async fn close(&self) -> RateLimitResult<()> {
        Ok(())
    }

    /// Backend name for logging and health reporting.
    fn name(&self) -> &str;
}
