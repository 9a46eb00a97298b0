//! Per-call rate limiting policies and the rate-spec parser.
//!
//! A [`Policy`] is an immutable description of one limit: how many requests,
//! over what period, counted by which algorithm, and what to do when the
//! backend is unreachable. Policies are cheap to clone and are validated
//! once at construction.

use crate::algorithms::Algorithm;
use crate::error::{RateLimitError, RateLimitResult};
use crate::key::RequestInfo;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether a request bypasses rate limiting entirely.
pub type SkipPredicate = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Parse a rate spec of the form `"<n>/<unit>"` or `"<n>/<k><unit>"` into
/// `(limit, period)`.
///
/// Units are `s`, `m`, `h` and `d`. `"10/30s"` means 10 requests per 30
/// seconds.
///
/// # Errors
///
/// Returns [`RateLimitError::Config`] for any other shape, a non-positive
/// count, or an overflowing period.
pub fn parse_rate(rate: &str) -> RateLimitResult<(u64, Duration)> {
    let bad = || RateLimitError::config(format!("invalid rate format: {rate:?}, use e.g. \"10/m\" or \"10/30s\""));

    let (limit_str, period_str) = rate.split_once('/').ok_or_else(bad)?;

    let limit: u64 = limit_str.trim().parse().map_err(|_| bad())?;
    if limit == 0 {
        return Err(bad());
    }

    let period_str = period_str.trim();
    if period_str.is_empty() || !period_str.is_ascii() {
        return Err(bad());
    }

    let (multiplier_str, unit) = period_str.split_at(period_str.len() - 1);
    let unit_secs: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(bad()),
    };

    let multiplier: u64 = if multiplier_str.is_empty() {
        1
    } else {
        let k: u64 = multiplier_str.parse().map_err(|_| bad())?;
        if k == 0 {
            return Err(bad());
        }
        k
    };

    let period_secs = multiplier.checked_mul(unit_secs).ok_or_else(bad)?;
    Ok((limit, Duration::from_secs(period_secs)))
}

/// An immutable rate limiting policy.
///
/// Built with [`Policy::new`] and the fluent setters, e.g.:
///
/// ```rust
/// use ratewarden::{Algorithm, Policy};
///
/// let policy = Policy::new("100/m").unwrap()
///     .algorithm(Algorithm::SlidingWindow)
///     .fail_open(true);
/// assert_eq!(policy.limit(), 100);
/// ```
#[derive(Clone)]
pub struct Policy {
    limit: u64,
    period: Duration,
    algorithm: Algorithm,
    bucket_size: Option<u64>,
    refill_rate: Option<f64>,
    align_to_clock: bool,
    block_on_exceed: bool,
    fail_open: bool,
    skip: Option<SkipPredicate>,
}

impl Policy {
    /// Create a policy from a rate spec such as `"100/m"`.
    ///
    /// Defaults: fixed window, clock-aligned, blocking on exceed,
    /// fail-closed, no skip predicate.
    pub fn new(rate: &str) -> RateLimitResult<Self> {
        let (limit, period) = parse_rate(rate)?;
        Self::with_limit(limit, period)
    }

    /// Create a policy from an explicit limit and period.
    pub fn with_limit(limit: u64, period: Duration) -> RateLimitResult<Self> {
        let policy = Self {
            limit,
            period,
            algorithm: Algorithm::FixedWindow,
            bucket_size: None,
            refill_rate: None,
            align_to_clock: true,
            block_on_exceed: true,
            fail_open: false,
            skip: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Set the counting algorithm.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Use the token bucket algorithm with an explicit capacity and refill
    /// rate (tokens per second).
    pub fn token_bucket(mut self, bucket_size: u64, refill_rate: f64) -> Self {
        self.algorithm = Algorithm::TokenBucket;
        self.bucket_size = Some(bucket_size);
        self.refill_rate = Some(refill_rate);
        self
    }

    /// Align fixed windows to clock boundaries (`floor(now / period)`).
    ///
    /// When disabled the window starts at the first request's arrival time.
    pub fn align_to_clock(mut self, align: bool) -> Self {
        self.align_to_clock = align;
        self
    }

    /// When `false`, over-limit checks still return `allowed = true` with
    /// `reason = LimitExceeded` so callers can observe without rejecting.
    pub fn block_on_exceed(mut self, block: bool) -> Self {
        self.block_on_exceed = block;
        self
    }

    /// Allow requests through when the backend is unreachable.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Skip rate limiting entirely when the predicate matches the request.
    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// Validate invariants. Called by the facade before every check so that
    /// a hand-assembled policy cannot smuggle a bad combination past
    /// construction.
    pub fn validate(&self) -> RateLimitResult<()> {
        if self.limit == 0 {
            return Err(RateLimitError::config("limit must be positive"));
        }
        if self.period < Duration::from_secs(1) {
            return Err(RateLimitError::config("period must be at least one second"));
        }
        if let Some(size) = self.bucket_size {
            if size < self.limit {
                return Err(RateLimitError::config(format!(
                    "bucket_size ({size}) must be >= limit ({})",
                    self.limit
                )));
            }
        }
        if self.algorithm == Algorithm::TokenBucket {
            match self.refill_rate {
                Some(rate) if rate > 0.0 => {}
                Some(rate) => {
                    return Err(RateLimitError::config(format!(
                        "refill_rate must be positive, got {rate}"
                    )));
                }
                None => {
                    return Err(RateLimitError::config(
                        "token bucket requires a refill_rate",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Maximum admissions per period (bucket capacity for token bucket).
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The counting window.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// The counting algorithm.
    pub fn algorithm_kind(&self) -> Algorithm {
        self.algorithm
    }

    /// Token bucket capacity; falls back to the limit when unset.
    pub fn bucket_capacity(&self) -> u64 {
        self.bucket_size.unwrap_or(self.limit)
    }

    /// Token bucket refill rate in tokens per second.
    pub fn bucket_refill_rate(&self) -> Option<f64> {
        self.refill_rate
    }

    /// Whether fixed windows align to clock boundaries.
    pub fn is_clock_aligned(&self) -> bool {
        self.align_to_clock
    }

    /// Whether over-limit requests are actually rejected.
    pub fn blocks_on_exceed(&self) -> bool {
        self.block_on_exceed
    }

    /// Whether backend failures admit the request.
    pub fn fails_open(&self) -> bool {
        self.fail_open
    }

    /// Evaluate the skip predicate, if any.
    pub fn should_skip(&self, info: &RequestInfo) -> bool {
        self.skip.as_ref().map(|p| p(info)).unwrap_or(false)
    }

    /// Replace the rate while keeping every other setting. Used by the
    /// middleware for per-path rate overrides.
    pub fn with_rate(mut self, rate: &str) -> RateLimitResult<Self> {
        let (limit, period) = parse_rate(rate)?;
        self.limit = limit;
        self.period = period;
        self.validate()?;
        Ok(self)
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("limit", &self.limit)
            .field("period", &self.period)
            .field("algorithm", &self.algorithm)
            .field("bucket_size", &self.bucket_size)
            .field("refill_rate", &self.refill_rate)
            .field("align_to_clock", &self.align_to_clock)
            .field("block_on_exceed", &self.block_on_exceed)
            .field("fail_open", &self.fail_open)
            .field("has_skip", &self.skip.is_some())
            .finish()
    }
}
