//! # Ratewarden
//!
//! Distributed rate limiting with pluggable storage backends, circuit
//! breakers and health-aware failover.
//!
//! ## Features
//!
//! - **Multiple algorithms**: fixed window, sliding window log, token bucket
//! - **Storage backends**: in-memory (DashMap, TTL + LRU) and Redis (atomic
//!   Lua scripts) behind one contract, plus an ordered multi-backend with
//!   failover
//! - **Reliability**: a circuit breaker per backend, background health
//!   probes, per-policy fail-open/fail-closed
//! - **Flexible keys**: literal keys, named selectors (address, principal,
//!   API key, path, ...) or custom functions, hashed past 200 bytes
//! - **Standard headers**: `X-RateLimit-Limit`, `X-RateLimit-Remaining`,
//!   `X-RateLimit-Reset`, `Retry-After`
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use ratewarden::{Algorithm, KeySource, Policy, RateLimiter, RequestInfo};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = RateLimiter::builder().build().await?;
//!
//! let policy = Policy::new("100/m")?.algorithm(Algorithm::SlidingWindow);
//! let info = RequestInfo::new("/api/users", "GET");
//!
//! let decision = limiter
//!     .check(&policy, &KeySource::literal("user_123"), &info)
//!     .await?;
//! if decision.allowed {
//!     println!("allowed, {} remaining", decision.remaining);
//! } else {
//!     println!("limited, retry after {:?}s", decision.retry_after);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Backend failures never surface from `check`: depending on the policy
//! the decision fails open (admit) or closed (deny), and the circuit
//! breaker keeps a struggling backend out of the hot path.

pub mod algorithms;
pub mod backend;
pub mod blocking;
pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod middleware;
pub mod policy;
pub mod resilience;

pub use algorithms::Algorithm;
pub use backend::{
    MemoryBackend, MemoryBackendConfig, MultiBackend, MultiStrategy, RateLimitBackend,
};
#[cfg(feature = "redis")]
pub use backend::{RedisBackend, RedisBackendConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendSpec, RateLimitConfig, RateLimiterBuilder};
pub use error::{RateLimitError, RateLimitResult};
pub use key::{KeySelector, KeySource, RequestInfo};
pub use middleware::{MiddlewareOutcome, RateLimitHeaders, RateLimitMiddleware};
pub use policy::{parse_rate, Policy};
pub use resilience::{
    BackendHealth, CircuitBreaker, CircuitBreakerConfig, CircuitState, HealthState,
};

use crate::backend::multi::{ChildStatus, MultiBackendStats};
use crate::resilience::HealthMonitor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// Counted and under the limit.
    Ok,
    /// The limit was reached. `allowed` is still true when the policy does
    /// not block on exceed.
    LimitExceeded,
    /// The policy's skip predicate matched; nothing was counted.
    Skipped,
    /// The backend failed and the policy admits on failure.
    FailOpen,
    /// The backend failed and the policy denies on failure.
    FailClosed,
}

/// Token bucket details carried on bucket decisions for the optional
/// response headers.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct BucketInfo {
    /// Bucket capacity.
    pub capacity: u64,
    /// Tokens per second.
    pub refill_rate: f64,
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Maximum admissions for the policy.
    pub limit: u64,
    /// Admissions left in the current window (tokens for buckets).
    pub remaining: u64,
    /// When the window resets or the bucket refills (epoch seconds).
    pub reset_at: u64,
    /// Seconds to wait before retrying; only set when denied.
    pub retry_after: Option<u64>,
    /// Why this decision was made.
    pub reason: Reason,
    /// Bucket details, for token bucket policies.
    pub bucket: Option<BucketInfo>,
}

impl Decision {
    fn from_verdict(verdict: algorithms::Verdict, policy: &Policy) -> Self {
        Self {
            allowed: verdict.allowed,
            limit: verdict.limit,
            remaining: verdict.remaining,
            reset_at: verdict.reset_at,
            retry_after: verdict.retry_after,
            reason: if verdict.allowed {
                Reason::Ok
            } else {
                Reason::LimitExceeded
            },
            bucket: bucket_info(policy),
        }
    }

    fn skipped(policy: &Policy, now_secs: u64) -> Self {
        Self {
            allowed: true,
            limit: policy.limit(),
            remaining: policy.limit(),
            reset_at: now_secs,
            retry_after: None,
            reason: Reason::Skipped,
            bucket: bucket_info(policy),
        }
    }

    fn fail_open(policy: &Policy, now_secs: u64) -> Self {
        Self {
            allowed: true,
            limit: policy.limit(),
            remaining: policy.limit(),
            reset_at: now_secs + policy.period().as_secs(),
            retry_after: None,
            reason: Reason::FailOpen,
            bucket: bucket_info(policy),
        }
    }

    fn fail_closed(policy: &Policy, now_secs: u64) -> Self {
        Self {
            allowed: false,
            limit: policy.limit(),
            remaining: 0,
            reset_at: now_secs + policy.period().as_secs(),
            retry_after: Some(policy.period().as_secs()),
            reason: Reason::FailClosed,
            bucket: bucket_info(policy),
        }
    }
}

fn bucket_info(policy: &Policy) -> Option<BucketInfo> {
    if policy.algorithm_kind() == Algorithm::TokenBucket {
        Some(BucketInfo {
            capacity: policy.bucket_capacity(),
            refill_rate: policy.bucket_refill_rate()?,
        })
    } else {
        None
    }
}

/// The rate limiter facade.
///
/// Construction-configured with backends, a clock and shared defaults;
/// thread-safe and meant to be long-lived and shared across all callers.
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    composite: Option<Arc<MultiBackend>>,
    monitor: Option<Arc<HealthMonitor>>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a builder.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Wrap an existing backend directly, without failover or health
    /// monitoring. Mostly useful for embedding and tests.
    pub fn new(
        backend: Arc<dyn RateLimitBackend>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            backend,
            composite: None,
            monitor: None,
            clock,
            config,
        }
    }

    pub(crate) fn from_parts(
        composite: Arc<MultiBackend>,
        monitor: Option<Arc<HealthMonitor>>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            backend: composite.clone(),
            composite: Some(composite),
            monitor,
            clock,
            config,
        }
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The policy built from the configured defaults.
    pub fn default_policy(&self) -> RateLimitResult<Policy> {
        self.config.default_policy()
    }

    /// Check whether a request identified by `key` is allowed under
    /// `policy`.
    ///
    /// Backend failures are absorbed into a fail-open or fail-closed
    /// decision; the only errors returned are configuration problems
    /// (malformed policy or key).
    pub async fn check(
        &self,
        policy: &Policy,
        key: &KeySource,
        info: &RequestInfo,
    ) -> RateLimitResult<Decision> {
        self.check_inner(policy, key, info, None).await
    }

    /// Like [`check`](Self::check), but abandons the backend call once the
    /// deadline elapses and resolves via the policy's failure mode.
    /// Counters mutated before the deadline stay mutated.
    pub async fn check_with_deadline(
        &self,
        policy: &Policy,
        key: &KeySource,
        info: &RequestInfo,
        deadline: Duration,
    ) -> RateLimitResult<Decision> {
        self.check_inner(policy, key, info, Some(deadline)).await
    }

    /// Check a literal key with no request context.
    pub async fn check_literal(&self, policy: &Policy, key: &str) -> RateLimitResult<Decision> {
        self.check(policy, &KeySource::literal(key), &RequestInfo::default())
            .await
    }

    async fn check_inner(
        &self,
        policy: &Policy,
        key: &KeySource,
        info: &RequestInfo,
        deadline: Option<Duration>,
    ) -> RateLimitResult<Decision> {
        policy.validate()?;

        if policy.should_skip(info) {
            trace!(path = %info.path(), "Skip predicate matched, not counting");
            return Ok(Decision::skipped(policy, self.clock.now_secs()));
        }

        let fingerprint = key.fingerprint(info)?;
        let storage_key = self.storage_key(policy.algorithm_kind(), &fingerprint);
        trace!(key = %storage_key, "Checking rate limit");

        let evaluation = algorithms::evaluate(
            self.backend.as_ref(),
            self.clock.as_ref(),
            policy,
            &storage_key,
        );
        let outcome = match deadline {
            None => evaluation.await,
            Some(deadline) => match tokio::time::timeout(deadline, evaluation).await {
                Ok(result) => result,
                Err(_) => Err(RateLimitError::transient("check deadline exceeded")),
            },
        };

        match outcome {
            Ok(verdict) => {
                let mut decision = Decision::from_verdict(verdict, policy);
                if !decision.allowed && !policy.blocks_on_exceed() {
                    // Observe-only mode: report the exceeded limit but let
                    // the request through.
                    decision.allowed = true;
                }
                Ok(decision)
            }
            Err(err) if err.is_backend_failure() => {
                warn!(
                    key = %storage_key,
                    error = %err,
                    fail_open = policy.fails_open(),
                    "Backend unavailable for rate limit check"
                );
                let now = self.clock.now_secs();
                Ok(if policy.fails_open() {
                    Decision::fail_open(policy, now)
                } else {
                    Decision::fail_closed(policy, now)
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Read the current state for a key without counting a request.
    pub async fn peek(
        &self,
        policy: &Policy,
        key: &KeySource,
        info: &RequestInfo,
    ) -> RateLimitResult<backend::PeekSnapshot> {
        let fingerprint = key.fingerprint(info)?;
        let storage_key = self.storage_key(policy.algorithm_kind(), &fingerprint);
        self.backend.peek(&storage_key, policy.algorithm_kind()).await
    }

    /// Erase all counter state for a key, across every algorithm.
    pub async fn reset(&self, key: &KeySource, info: &RequestInfo) -> RateLimitResult<()> {
        let fingerprint = key.fingerprint(info)?;
        for tag in Algorithm::all_tags() {
            let storage_key = format!("{}{}:{}", self.config.key_prefix, tag, fingerprint);
            self.backend.reset(&storage_key).await?;
        }
        Ok(())
    }

    /// Current health of each backend, as recorded by the probe loop.
    pub fn health(&self) -> HashMap<String, BackendHealth> {
        self.monitor
            .as_ref()
            .map(|m| m.snapshot())
            .unwrap_or_default()
    }

    /// Probe all backends immediately, updating health and circuits.
    pub async fn probe_now(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.probe_all().await;
        }
    }

    /// Per-backend circuit status, when configured with failover.
    pub fn backend_status(&self) -> Option<HashMap<String, ChildStatus>> {
        self.composite.as_ref().map(|m| m.status())
    }

    /// Aggregate backend statistics, when configured with failover.
    pub fn backend_stats(&self) -> Option<MultiBackendStats> {
        self.composite.as_ref().map(|m| m.stats())
    }

    /// Stop the health probe loop and close all backends. New checks fail
    /// per the policy's failure mode.
    pub async fn shutdown(&self) -> RateLimitResult<()> {
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        self.backend.close().await
    }

    fn storage_key(&self, algorithm: Algorithm, fingerprint: &str) -> String {
        format!(
            "{}{}:{}",
            self.config.key_prefix,
            algorithm.storage_tag(),
            fingerprint
        )
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.backend.name())
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}
