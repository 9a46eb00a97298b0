//! Synchronous facade over the async limiter.
//!
//! The core is async; callers in synchronous code construct a
//! [`blocking::RateLimiter`](RateLimiter) which owns a small
//! current-thread Tokio runtime and drives the async facade to
//! completion on each call. The call style is chosen here, at
//! construction, never detected per call.

use crate::config::RateLimiterBuilder;
use crate::error::{RateLimitError, RateLimitResult};
use crate::key::{KeySource, RequestInfo};
use crate::policy::Policy;
use crate::resilience::BackendHealth;
use crate::Decision;
use std::collections::HashMap;

/// Blocking wrapper around [`crate::RateLimiter`].
#[derive(Debug)]
pub struct RateLimiter {
    inner: crate::RateLimiter,
    runtime: tokio::runtime::Runtime,
}

impl RateLimiter {
    /// Build a blocking limiter from the standard builder.
    ///
    /// Must not be called from within an async runtime; async callers use
    /// [`crate::RateLimiter`] directly.
    pub fn build(builder: RateLimiterBuilder) -> RateLimitResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .enable_io()
            .build()
            .map_err(|e| RateLimitError::config(format!("failed to start runtime: {e}")))?;
        let inner = runtime.block_on(builder.build())?;
        Ok(Self { inner, runtime })
    }

    /// Blocking equivalent of [`crate::RateLimiter::check`].
    pub fn check(
        &self,
        policy: &Policy,
        key: &KeySource,
        info: &RequestInfo,
    ) -> RateLimitResult<Decision> {
        self.runtime.block_on(self.inner.check(policy, key, info))
    }

    /// Blocking check of a literal key with no request context.
    pub fn check_literal(&self, policy: &Policy, key: &str) -> RateLimitResult<Decision> {
        self.runtime.block_on(self.inner.check_literal(policy, key))
    }

    /// Blocking equivalent of [`crate::RateLimiter::reset`].
    pub fn reset(&self, key: &KeySource, info: &RequestInfo) -> RateLimitResult<()> {
        self.runtime.block_on(self.inner.reset(key, info))
    }

    /// Current backend health snapshot.
    pub fn health(&self) -> HashMap<String, BackendHealth> {
        self.inner.health()
    }

    /// Stop background tasks and close the backends.
    pub fn shutdown(&self) -> RateLimitResult<()> {
        self.runtime.block_on(self.inner.shutdown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackendConfig;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_blocking_check() {
        let clock = Arc::new(ManualClock::at_secs(600));
        let limiter = RateLimiter::build(
            crate::RateLimiter::builder()
                .clock(clock)
                .memory_backend(MemoryBackendConfig {
                    cleanup_interval: Duration::ZERO,
                    ..Default::default()
                })
                .health_check_interval(Duration::ZERO),
        )
        .unwrap();

        let policy = Policy::new("2/m").unwrap();
        assert!(limiter.check_literal(&policy, "k").unwrap().allowed);
        assert!(limiter.check_literal(&policy, "k").unwrap().allowed);
        assert!(!limiter.check_literal(&policy, "k").unwrap().allowed);

        limiter
            .reset(&KeySource::literal("k"), &RequestInfo::default())
            .unwrap();
        assert!(limiter.check_literal(&policy, "k").unwrap().allowed);

        limiter.shutdown().unwrap();
    }
}
