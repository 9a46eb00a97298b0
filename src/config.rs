//! Limiter configuration and builder.

use crate::algorithms::Algorithm;
use crate::backend::{
    MemoryBackend, MemoryBackendConfig, MultiBackend, MultiStrategy, RateLimitBackend,
};
#[cfg(feature = "redis")]
use crate::backend::RedisBackendConfig;
use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitError, RateLimitResult};
use crate::policy::Policy;
use crate::resilience::{CircuitBreakerConfig, HealthMonitor};
use crate::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration shared by every check through a limiter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RateLimitConfig {
    /// Prefix for storage keys; full keys are
    /// `"<key_prefix><algorithm>:<fingerprint>"`.
    pub key_prefix: String,
    /// Rate used when a caller asks for the default policy.
    pub default_rate: String,
    /// Algorithm used by the default policy.
    pub default_algorithm: Algorithm,
    /// Whether fixed windows align to clock boundaries by default.
    pub align_window_to_clock: bool,
    /// Whether the default policy admits requests on backend failure.
    pub fail_open: bool,
    /// Path prefixes exempt from rate limiting (middleware surface).
    pub skip_paths: Vec<String>,
    /// `(path_prefix, rate)` overrides consulted by the middleware; the
    /// first matching prefix wins.
    pub path_rates: Vec<(String, String)>,
    /// Interval between background health probes. Zero disables the
    /// probe loop.
    pub health_check_interval: Duration,
    /// Failover strategy when several backends are configured.
    pub multi_strategy: MultiStrategy,
    /// Circuit breaker settings applied to each backend.
    pub circuit: CircuitBreakerConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rl:".to_string(),
            default_rate: "100/m".to_string(),
            default_algorithm: Algorithm::FixedWindow,
            align_window_to_clock: true,
            fail_open: false,
            skip_paths: Vec::new(),
            path_rates: Vec::new(),
            health_check_interval: Duration::from_secs(30),
            multi_strategy: MultiStrategy::FirstHealthy,
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Whether the path is exempt from rate limiting.
    pub fn should_skip_path(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Rate override for the path, if any prefix matches.
    pub fn rate_for_path(&self, path: &str) -> Option<&str> {
        self.path_rates
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, rate)| rate.as_str())
    }

    /// Build the default policy from this configuration.
    pub fn default_policy(&self) -> RateLimitResult<Policy> {
        Ok(Policy::new(&self.default_rate)?
            .algorithm(self.default_algorithm)
            .align_to_clock(self.align_window_to_clock)
            .fail_open(self.fail_open))
    }
}

/// How one child backend should be constructed.
pub enum BackendSpec {
    /// In-process storage.
    Memory(MemoryBackendConfig),
    /// Redis storage.
    #[cfg(feature = "redis")]
    Redis(RedisBackendConfig),
    /// A caller-constructed backend (custom drivers, test doubles).
    Custom(Arc<dyn RateLimitBackend>),
}

impl std::fmt::Debug for BackendSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(cfg) => f.debug_tuple("Memory").field(cfg).finish(),
            #[cfg(feature = "redis")]
            Self::Redis(cfg) => f.debug_tuple("Redis").field(cfg).finish(),
            Self::Custom(backend) => f.debug_tuple("Custom").field(&backend.name()).finish(),
        }
    }
}

/// Builder for a [`RateLimiter`].
///
/// Backends are tried in the order they were added; the first healthy one
/// serves each operation (or they rotate, with `round_robin`).
pub struct RateLimiterBuilder {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    backends: Vec<(String, BackendSpec)>,
}

impl RateLimiterBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: RateLimitConfig::default(),
            clock: Arc::new(SystemClock),
            backends: Vec::new(),
        }
    }

    /// Add an in-memory backend.
    pub fn memory_backend(self, config: MemoryBackendConfig) -> Self {
        self.backend("memory", BackendSpec::Memory(config))
    }

    /// Add a Redis backend.
    #[cfg(feature = "redis")]
    pub fn redis_backend(self, config: RedisBackendConfig) -> Self {
        self.backend("redis", BackendSpec::Redis(config))
    }

    /// Add a named backend spec. Order matters: earlier backends are
    /// preferred.
    pub fn backend(mut self, name: impl Into<String>, spec: BackendSpec) -> Self {
        self.backends.push((name.into(), spec));
        self
    }

    /// Replace the backend list with an ordered set of named specs.
    pub fn backends(mut self, specs: Vec<(String, BackendSpec)>) -> Self {
        self.backends = specs;
        self
    }

    /// Add a caller-constructed backend.
    pub fn custom_backend(
        self,
        name: impl Into<String>,
        backend: Arc<dyn RateLimitBackend>,
    ) -> Self {
        self.backend(name, BackendSpec::Custom(backend))
    }

    /// Replace the clock (tests inject a [`crate::ManualClock`] here).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the storage key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Set the default rate spec.
    pub fn default_rate(mut self, rate: impl Into<String>) -> Self {
        self.config.default_rate = rate.into();
        self
    }

    /// Set the default algorithm.
    pub fn default_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.config.default_algorithm = algorithm;
        self
    }

    /// Align fixed windows to clock boundaries by default.
    pub fn align_window_to_clock(mut self, align: bool) -> Self {
        self.config.align_window_to_clock = align;
        self
    }

    /// Admit requests when all backends fail (default policy only).
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.config.fail_open = fail_open;
        self
    }

    /// Exempt a path prefix from rate limiting.
    pub fn skip_path(mut self, prefix: impl Into<String>) -> Self {
        self.config.skip_paths.push(prefix.into());
        self
    }

    /// Override the rate for a path prefix.
    pub fn path_rate(mut self, prefix: impl Into<String>, rate: impl Into<String>) -> Self {
        self.config.path_rates.push((prefix.into(), rate.into()));
        self
    }

    /// Set the background health probe interval. Zero disables probing.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Set the failover strategy across backends.
    pub fn multi_strategy(mut self, strategy: MultiStrategy) -> Self {
        self.config.multi_strategy = strategy;
        self
    }

    /// Set the circuit breaker configuration applied to each backend.
    pub fn circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.config.circuit = circuit;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }

    /// Construct the limiter: build each backend, wrap them in the
    /// failover composite, start the health monitor.
    pub async fn build(mut self) -> RateLimitResult<RateLimiter> {
        // Validate the default rate up front; a bad spec should fail
        // construction, not the first check.
        self.config.default_policy()?;

        if self.backends.is_empty() {
            self.backends.push((
                "memory".to_string(),
                BackendSpec::Memory(MemoryBackendConfig::default()),
            ));
        }

        debug!(
            backends = self.backends.len(),
            strategy = self.config.multi_strategy.as_str(),
            "Building rate limiter"
        );

        let mut children: Vec<(String, Arc<dyn RateLimitBackend>)> = Vec::new();
        for (name, spec) in self.backends {
            let backend: Arc<dyn RateLimitBackend> = match spec {
                BackendSpec::Memory(cfg) => MemoryBackend::new(cfg, self.clock.clone()),
                #[cfg(feature = "redis")]
                BackendSpec::Redis(cfg) => {
                    crate::backend::RedisBackend::new(cfg, self.clock.clone()).await?
                }
                BackendSpec::Custom(backend) => backend,
            };
            if children.iter().any(|(existing, _)| *existing == name) {
                return Err(RateLimitError::config(format!(
                    "duplicate backend name: {name:?}"
                )));
            }
            children.push((name, backend));
        }

        let multi = MultiBackend::new(
            children,
            self.config.multi_strategy,
            self.config.circuit.clone(),
        )?;

        let monitor = HealthMonitor::new(
            multi.children(),
            self.config.health_check_interval,
            self.clock.clone(),
        );
        monitor.start();

        Ok(RateLimiter::from_parts(
            multi,
            Some(monitor),
            self.clock,
            self.config,
        ))
    }
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.key_prefix, "rl:");
        assert_eq!(config.default_rate, "100/m");
        assert!(config.align_window_to_clock);
        assert!(!config.fail_open);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_skip_and_path_rates() {
        let config = RateLimitConfig {
            skip_paths: vec!["/health".to_string(), "/metrics".to_string()],
            path_rates: vec![
                ("/api/auth".to_string(), "5/m".to_string()),
                ("/api".to_string(), "100/m".to_string()),
            ],
            ..Default::default()
        };

        assert!(config.should_skip_path("/health/live"));
        assert!(!config.should_skip_path("/api/users"));

        assert_eq!(config.rate_for_path("/api/auth/login"), Some("5/m"));
        assert_eq!(config.rate_for_path("/api/users"), Some("100/m"));
        assert_eq!(config.rate_for_path("/static/app.js"), None);
    }

    #[tokio::test]
    async fn test_build_defaults_to_memory() {
        let limiter = RateLimiterBuilder::new().build().await.unwrap();
        let policy = limiter.default_policy().unwrap();
        assert_eq!(policy.limit(), 100);
    }

    #[tokio::test]
    async fn test_build_rejects_bad_default_rate() {
        let result = RateLimiterBuilder::new().default_rate("lots").build().await;
        assert!(matches!(result, Err(RateLimitError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_duplicate_names() {
        let result = RateLimiterBuilder::new()
            .memory_backend(MemoryBackendConfig::default())
            .memory_backend(MemoryBackendConfig::default())
            .build()
            .await;
        assert!(matches!(result, Err(RateLimitError::Config(_))));
    }
}
