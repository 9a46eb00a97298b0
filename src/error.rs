//! Error types for rate limiting.

use thiserror::Error;

/// Result type for rate limiting operations.
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Rate limiting errors.
///
/// Backend failures never reach callers of [`crate::RateLimiter::check`];
/// the facade converts them into fail-open or fail-closed decisions. The
/// only errors a caller sees from `check` are configuration problems.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Invalid configuration: bad rate spec, unknown algorithm, impossible
    /// combination. Raised at construction or when a malformed policy is
    /// passed to `check`.
    #[error("Rate limit configuration error: {0}")]
    Config(String),

    /// Key extraction failed (malformed selector, missing context).
    #[error("Failed to extract rate limit key: {0}")]
    KeyExtraction(String),

    /// Transient backend failure: network error, timeout, pool exhaustion.
    /// Feeds the circuit breaker with weight 1.
    #[error("Backend transient failure: {0}")]
    Transient(String),

    /// Non-transient backend failure: protocol or script error. Feeds the
    /// circuit breaker with weight 2.
    #[error("Backend failure: {0}")]
    Fatal(String),

    /// All configured backends failed for this operation.
    #[error("No rate limit backend available")]
    Unavailable,

    /// The circuit breaker for a backend is open; the call was
    /// short-circuited without touching the backend.
    #[error("Circuit open for backend {0}")]
    CircuitOpen(String),

    /// The backend is shutting down and no longer accepts operations.
    #[error("Backend is closed")]
    Closed,
}

impl RateLimitError {
    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a key extraction error.
    pub fn key_extraction<S: Into<String>>(msg: S) -> Self {
        Self::KeyExtraction(msg.into())
    }

    /// Create a transient backend error.
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal backend error.
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether this error means the backend could not serve the call and
    /// the fail-open/fail-closed policy applies.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::Transient(_)
                | Self::Fatal(_)
                | Self::Unavailable
                | Self::CircuitOpen(_)
                | Self::Closed
        )
    }

    /// Weight of this failure in the circuit breaker's window.
    ///
    /// Protocol-level failures count double; anything non-backend counts
    /// nothing.
    pub fn failure_weight(&self) -> u32 {
        match self {
            Self::Fatal(_) => 2,
            Self::Transient(_) | Self::Closed => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_classification() {
        assert!(RateLimitError::transient("timeout").is_backend_failure());
        assert!(RateLimitError::fatal("bad script").is_backend_failure());
        assert!(RateLimitError::Unavailable.is_backend_failure());
        assert!(RateLimitError::CircuitOpen("redis".into()).is_backend_failure());
        assert!(RateLimitError::Closed.is_backend_failure());

        assert!(!RateLimitError::config("bad rate").is_backend_failure());
        assert!(!RateLimitError::key_extraction("no ip").is_backend_failure());
    }

    #[test]
    fn test_failure_weight() {
        assert_eq!(RateLimitError::fatal("script").failure_weight(), 2);
        assert_eq!(RateLimitError::transient("io").failure_weight(), 1);
        assert_eq!(RateLimitError::config("x").failure_weight(), 0);
    }

    #[test]
    fn test_display() {
        let err = RateLimitError::config("invalid rate format: 10/x");
        assert!(err.to_string().contains("invalid rate format"));
    }
}
