//! HTTP glue: response headers and a framework-agnostic middleware helper.
//!
//! The host framework owns request and response objects; this module only
//! turns a [`Decision`] into the standard header set and bundles the
//! per-request flow (skip paths, path rate overrides, key extraction,
//! check) into one call.

use crate::config::RateLimitConfig;
use crate::error::RateLimitResult;
use crate::key::{KeySource, RequestInfo};
use crate::policy::Policy;
use crate::{Decision, RateLimiter};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Standard rate limit headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHeaders {
    /// `X-RateLimit-Limit`: maximum requests allowed.
    pub limit: u64,
    /// `X-RateLimit-Remaining`: requests remaining in the current window.
    pub remaining: u64,
    /// `X-RateLimit-Reset`: epoch seconds when the limit resets.
    pub reset: u64,
    /// `Retry-After`: seconds until the client should retry (only when
    /// limited).
    pub retry_after: Option<u64>,
    /// `X-RateLimit-Bucket-Capacity` (token bucket only).
    pub bucket_capacity: Option<u64>,
    /// `X-RateLimit-Bucket-Refill-Rate` (token bucket only).
    pub refill_rate: Option<f64>,
}

impl RateLimitHeaders {
    /// Build headers from a decision.
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at,
            retry_after: if decision.allowed {
                None
            } else {
                decision.retry_after
            },
            bucket_capacity: decision.bucket.map(|b| b.capacity),
            refill_rate: decision.bucket.map(|b| b.refill_rate),
        }
    }

    /// Header name/value pairs ready to copy onto a response.
    pub fn to_header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ];
        if let Some(retry) = self.retry_after {
            headers.push(("Retry-After", retry.to_string()));
        }
        if let Some(capacity) = self.bucket_capacity {
            headers.push(("X-RateLimit-Bucket-Capacity", capacity.to_string()));
        }
        if let Some(rate) = self.refill_rate {
            headers.push(("X-RateLimit-Bucket-Refill-Rate", format!("{rate:.2}")));
        }
        headers
    }
}

/// Outcome of a middleware check, for the host to act on.
#[derive(Debug, Clone)]
pub enum MiddlewareOutcome {
    /// Let the request through, attaching headers when present.
    Allowed {
        /// Headers to copy onto the response.
        headers: Option<RateLimitHeaders>,
    },
    /// Reject the request with 429.
    Limited {
        /// Headers to copy onto the response.
        headers: Option<RateLimitHeaders>,
        /// Seconds until a retry may succeed.
        retry_after: Option<u64>,
        /// Body/message for the rejection.
        message: String,
    },
}

/// Framework-agnostic rate limiting middleware.
///
/// The host adapts its request type into a [`RequestInfo`], calls
/// [`handle`](Self::handle), and maps the outcome onto its response type.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    key: KeySource,
    policy: Policy,
    include_headers: bool,
    error_message: String,
}

impl RateLimitMiddleware {
    /// Create middleware using the limiter's default policy and
    /// client-address keying.
    pub fn new(limiter: Arc<RateLimiter>) -> RateLimitResult<Self> {
        let policy = limiter.default_policy()?;
        Ok(Self {
            limiter,
            key: KeySource::client_ip(),
            policy,
            include_headers: true,
            error_message: "Rate limit exceeded".to_string(),
        })
    }

    /// Use a specific policy instead of the configured default.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Use a specific key source.
    pub fn with_key(mut self, key: KeySource) -> Self {
        self.key = key;
        self
    }

    /// Whether to attach rate limit headers to responses.
    pub fn with_headers(mut self, include: bool) -> Self {
        self.include_headers = include;
        self
    }

    /// Message returned with 429 responses.
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    fn config(&self) -> &RateLimitConfig {
        self.limiter.config()
    }

    /// Run the full per-request flow for one request.
    pub async fn handle(&self, info: &RequestInfo) -> RateLimitResult<MiddlewareOutcome> {
        if self.config().should_skip_path(info.path()) {
            debug!(path = %info.path(), "Path is exempt from rate limiting");
            return Ok(MiddlewareOutcome::Allowed { headers: None });
        }

        // Per-path rate override, first matching prefix wins.
        let policy = match self.config().rate_for_path(info.path()) {
            Some(rate) => self.policy.clone().with_rate(rate)?,
            None => self.policy.clone(),
        };

        let decision = self.limiter.check(&policy, &self.key, info).await?;
        let headers = self
            .include_headers
            .then(|| RateLimitHeaders::from_decision(&decision));

        if decision.allowed {
            trace!(path = %info.path(), remaining = decision.remaining, "Request allowed");
            Ok(MiddlewareOutcome::Allowed { headers })
        } else {
            info!(
                path = %info.path(),
                reason = ?decision.reason,
                retry_after = ?decision.retry_after,
                "Request rate limited"
            );
            Ok(MiddlewareOutcome::Limited {
                headers,
                retry_after: decision.retry_after,
                message: self.error_message.clone(),
            })
        }
    }
}

impl std::fmt::Debug for RateLimitMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .field("include_headers", &self.include_headers)
            .finish()
    }
}

/// Convenience: headers for a decision, regardless of outcome.
impl From<&Decision> for RateLimitHeaders {
    fn from(decision: &Decision) -> Self {
        Self::from_decision(decision)
    }
}
