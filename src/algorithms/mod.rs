//! Rate limiting algorithms.
//!
//! Each algorithm is a thin orchestrator over a single backend primitive:
//!
//! - **Fixed window**: one atomic increment per request, simple but allows
//!   bursts at window boundaries
//! - **Sliding window**: a pruned log of request timestamps, precise
//! - **Token bucket**: refill-then-consume, smooth limiting with burst
//!   capacity

use crate::backend::RateLimitBackend;
use crate::clock::Clock;
use crate::error::{RateLimitError, RateLimitResult};
use crate::policy::Policy;
use serde::{Deserialize, Serialize};

/// The counting algorithm used by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Fixed time windows with one counter per window.
    FixedWindow,
    /// Sliding log of request timestamps.
    SlidingWindow,
    /// Token bucket with burst capacity and steady refill.
    TokenBucket,
}

impl Algorithm {
    /// Short tag used in storage keys (`"<prefix><tag>:<fingerprint>"`).
    pub fn storage_tag(&self) -> &'static str {
        match self {
            Self::FixedWindow => "fixed",
            Self::SlidingWindow => "sliding",
            Self::TokenBucket => "bucket",
        }
    }

    /// Parse an algorithm name as it appears in host configuration.
    pub fn from_name(name: &str) -> RateLimitResult<Self> {
        match name {
            "fixed_window" | "fixed" => Ok(Self::FixedWindow),
            "sliding_window" | "sliding" => Ok(Self::SlidingWindow),
            "token_bucket" | "bucket" => Ok(Self::TokenBucket),
            other => Err(RateLimitError::config(format!(
                "unknown algorithm: {other:?}"
            ))),
        }
    }

    /// All tags, for operations that sweep every per-algorithm key.
    pub(crate) fn all_tags() -> [&'static str; 3] {
        ["fixed", "sliding", "bucket"]
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.storage_tag())
    }
}

/// Outcome of one algorithm evaluation, before policy post-processing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Verdict {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    pub retry_after: Option<u64>,
}

/// Run one check against the backend primitive for the policy's algorithm.
pub(crate) async fn evaluate(
    backend: &dyn RateLimitBackend,
    clock: &dyn Clock,
    policy: &Policy,
    storage_key: &str,
) -> RateLimitResult<Verdict> {
    match policy.algorithm_kind() {
        Algorithm::FixedWindow => {
            let snap = backend
                .incr_fixed(storage_key, policy.period(), policy.is_clock_aligned())
                .await?;
            let allowed = snap.count <= policy.limit();
            let retry_after = if allowed {
                None
            } else {
                Some(snap.reset_at.saturating_sub(clock.now_secs()).max(1))
            };
            Ok(Verdict {
                allowed,
                limit: policy.limit(),
                remaining: policy.limit().saturating_sub(snap.count),
                reset_at: snap.reset_at,
                retry_after,
            })
        }
        Algorithm::SlidingWindow => {
            let snap = backend
                .check_sliding(
                    storage_key,
                    policy.period(),
                    policy.limit(),
                    clock.now_millis(),
                )
                .await?;
            let retry_after = if snap.admitted {
                None
            } else {
                Some(snap.reset_at.saturating_sub(clock.now_secs()).max(1))
            };
            Ok(Verdict {
                allowed: snap.admitted,
                limit: policy.limit(),
                remaining: policy.limit().saturating_sub(snap.count),
                reset_at: snap.reset_at,
                retry_after,
            })
        }
        Algorithm::TokenBucket => {
            let capacity = policy.bucket_capacity();
            let refill_rate = policy
                .bucket_refill_rate()
                .ok_or_else(|| RateLimitError::config("token bucket requires a refill_rate"))?;
            let snap = backend
                .check_bucket(
                    storage_key,
                    capacity,
                    refill_rate,
                    policy.period(),
                    clock.now_millis(),
                    1.0,
                )
                .await?;
            let retry_after = if snap.admitted {
                None
            } else {
                // Time until one whole token is back.
                Some(((1.0 - snap.tokens).max(0.0) / refill_rate).ceil() as u64)
            };
            Ok(Verdict {
                allowed: snap.admitted,
                limit: capacity,
                remaining: snap.tokens.floor().max(0.0) as u64,
                reset_at: snap.reset_at,
                retry_after,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_tags_are_distinct() {
        let tags = Algorithm::all_tags();
        assert_eq!(tags.len(), 3);
        for (i, a) in tags.iter().enumerate() {
            for b in tags.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            Algorithm::from_name("fixed_window").unwrap(),
            Algorithm::FixedWindow
        );
        assert_eq!(
            Algorithm::from_name("sliding").unwrap(),
            Algorithm::SlidingWindow
        );
        assert_eq!(
            Algorithm::from_name("token_bucket").unwrap(),
            Algorithm::TokenBucket
        );
        assert!(Algorithm::from_name("leaky_bucket").is_err());
    }

    #[test]
    fn test_display_matches_tag() {
        assert_eq!(Algorithm::TokenBucket.to_string(), "bucket");
    }
}
