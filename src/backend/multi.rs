//! Composite backend with health-aware failover.
//!
//! Holds an ordered list of named child backends, each guarded by its own
//! circuit breaker. An operation walks the candidates (in configured
//! order, or rotated for round-robin), skips children whose circuit is not
//! accepting calls, and returns the first success. Failures are recorded
//! against the failing child's circuit and the walk continues.
//!
//! Counters are not shared between children: a failover under-counts in
//! the new primary until existing windows expire. That is documented
//! behavior, not a bug.

use crate::algorithms::Algorithm;
use crate::backend::{
    FixedWindowSnapshot, PeekSnapshot, RateLimitBackend, SlidingWindowSnapshot,
    TokenBucketSnapshot,
};
use crate::error::{RateLimitError, RateLimitResult};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Failover strategy across child backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiStrategy {
    /// Always start from the first configured backend.
    #[default]
    FirstHealthy,
    /// Rotate the starting backend per operation; failures still fall
    /// through to the remaining candidates.
    RoundRobin,
}

impl MultiStrategy {
    /// Strategy name as it appears in host configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstHealthy => "first_healthy",
            Self::RoundRobin => "round_robin",
        }
    }

    /// Parse a strategy name from host configuration.
    pub fn from_name(name: &str) -> RateLimitResult<Self> {
        match name {
            "first_healthy" => Ok(Self::FirstHealthy),
            "round_robin" => Ok(Self::RoundRobin),
            other => Err(RateLimitError::config(format!(
                "unknown multi-backend strategy: {other:?}"
            ))),
        }
    }
}

/// Point-in-time view of one child backend.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChildStatus {
    /// Whether the circuit currently lets calls through.
    pub healthy: bool,
    /// Circuit state.
    pub circuit: CircuitState,
    /// Weighted failures inside the circuit's window.
    pub failures_in_window: u32,
}

/// Aggregate view of the composite.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MultiBackendStats {
    /// Configured children.
    pub total_backends: usize,
    /// Children whose circuit currently lets calls through.
    pub available_backends: usize,
    /// Active failover strategy.
    pub strategy: &'static str,
}

struct Child {
    name: String,
    backend: Arc<dyn RateLimitBackend>,
    circuit: Arc<CircuitBreaker>,
}

/// Ordered list of backends with circuit-gated failover.
pub struct MultiBackend {
    children: Vec<Child>,
    strategy: MultiStrategy,
    cursor: AtomicUsize,
    name: String,
}

type OpFuture<T> = Pin<Box<dyn Future<Output = RateLimitResult<T>> + Send>>;

impl MultiBackend {
    /// Build a composite over the named children, giving each its own
    /// circuit breaker with the supplied configuration.
    pub fn new(
        children: Vec<(String, Arc<dyn RateLimitBackend>)>,
        strategy: MultiStrategy,
        circuit_config: CircuitBreakerConfig,
    ) -> RateLimitResult<Arc<Self>> {
        if children.is_empty() {
            return Err(RateLimitError::config(
                "multi-backend requires at least one child backend",
            ));
        }
        debug!(
            backends = children.len(),
            strategy = strategy.as_str(),
            "Creating multi-backend"
        );
        Ok(Arc::new(Self {
            children: children
                .into_iter()
                .map(|(name, backend)| {
                    let circuit = CircuitBreaker::new(name.clone(), circuit_config.clone());
                    Child {
                        name,
                        backend,
                        circuit,
                    }
                })
                .collect(),
            strategy,
            cursor: AtomicUsize::new(0),
            name: "multi".to_string(),
        }))
    }

    /// `(name, backend, circuit)` triples for wiring the health monitor.
    pub fn children(&self) -> Vec<(String, Arc<dyn RateLimitBackend>, Arc<CircuitBreaker>)> {
        self.children
            .iter()
            .map(|c| (c.name.clone(), c.backend.clone(), c.circuit.clone()))
            .collect()
    }

    /// Per-child status keyed by backend name.
    pub fn status(&self) -> HashMap<String, ChildStatus> {
        self.children
            .iter()
            .map(|c| {
                let circuit = c.circuit.state();
                (
                    c.name.clone(),
                    ChildStatus {
                        healthy: circuit != CircuitState::Open,
                        circuit,
                        failures_in_window: c.circuit.failures_in_window(),
                    },
                )
            })
            .collect()
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> MultiBackendStats {
        let available = self
            .children
            .iter()
            .filter(|c| c.circuit.state() != CircuitState::Open)
            .count();
        MultiBackendStats {
            total_backends: self.children.len(),
            available_backends: available,
            strategy: self.strategy.as_str(),
        }
    }

    fn candidate_order(&self) -> Vec<usize> {
        let n = self.children.len();
        match self.strategy {
            MultiStrategy::FirstHealthy => (0..n).collect(),
            MultiStrategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
                (0..n).map(|i| (start + i) % n).collect()
            }
        }
    }

    /// Walk candidates until one serves the operation.
    async fn attempt<T>(
        &self,
        op: &str,
        run: impl Fn(Arc<dyn RateLimitBackend>) -> OpFuture<T>,
    ) -> RateLimitResult<T> {
        for index in self.candidate_order() {
            let child = &self.children[index];
            if !child.circuit.acquire() {
                trace!(backend = %child.name, op, "Skipping backend, circuit not accepting calls");
                continue;
            }

            match run(child.backend.clone()).await {
                Ok(value) => {
                    child.circuit.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    warn!(
                        backend = %child.name,
                        op,
                        error = %err,
                        "Backend failed, trying next candidate"
                    );
                    child.circuit.record_failure(err.failure_weight());
                }
            }
        }
        Err(RateLimitError::Unavailable)
    }
}

#[async_trait]
impl RateLimitBackend for MultiBackend {
    async fn incr_fixed(
        &self,
        key: &str,
        period: Duration,
        align_to_clock: bool,
    ) -> RateLimitResult<FixedWindowSnapshot> {
        let key = key.to_string();
        self.attempt("incr_fixed", move |backend| {
            let key = key.clone();
            Box::pin(async move { backend.incr_fixed(&key, period, align_to_clock).await })
        })
        .await
    }

    async fn check_sliding(
        &self,
        key: &str,
        period: Duration,
        limit: u64,
        now_ms: u64,
    ) -> RateLimitResult<SlidingWindowSnapshot> {
        let key = key.to_string();
        self.attempt("check_sliding", move |backend| {
            let key = key.clone();
            Box::pin(async move { backend.check_sliding(&key, period, limit, now_ms).await })
        })
        .await
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
        let key = key.to_string();
        self.attempt("check_bucket", move |backend| {
            let key = key.clone();
            Box::pin(async move {
                backend
                    .check_bucket(&key, capacity, refill_rate, period, now_ms, cost)
                    .await
            })
        })
        .await
    }

    async fn peek(&self, key: &str, algorithm: Algorithm) -> RateLimitResult<PeekSnapshot> {
        let key = key.to_string();
        self.attempt("peek", move |backend| {
            let key = key.clone();
            Box::pin(async move { backend.peek(&key, algorithm).await })
        })
        .await
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        // Failover may have left counters on several children; clear them
        // all. Succeeds if any child accepted the reset.
        let mut any_ok = false;
        let mut last_err = RateLimitError::Unavailable;
        for child in &self.children {
            match child.backend.reset(key).await {
                Ok(()) => any_ok = true,
                Err(err) => {
                    child.circuit.record_failure(err.failure_weight());
                    last_err = err;
                }
            }
        }
        if any_ok { Ok(()) } else { Err(last_err) }
    }

    async fn probe(&self) -> RateLimitResult<()> {
        // Probes bypass the circuits on purpose; they are how a tripped
        // circuit learns its backend recovered.
        let mut any_ok = false;
        for child in &self.children {
            match child.backend.probe().await {
                Ok(()) => {
                    any_ok = true;
                    if child.circuit.state() != CircuitState::Closed {
                        child.circuit.record_success();
                    }
                }
                Err(err) => {
                    child.circuit.record_failure(err.failure_weight());
                }
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(RateLimitError::Unavailable)
        }
    }

    async fn close(&self) -> RateLimitResult<()> {
        let mut first_err = None;
        for child in &self.children {
            if let Err(err) = child.backend.close().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MultiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBackend")
            .field("strategy", &self.strategy)
            .field(
                "children",
                &self.children.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryBackendConfig};
    use crate::clock::ManualClock;

    /// A backend that fails every operation with a transient error.
    struct DownBackend;

    #[async_trait]
    impl RateLimitBackend for DownBackend {
        async fn incr_fixed(
            &self,
            _key: &str,
            _period: Duration,
            _align_to_clock: bool,
        ) -> RateLimitResult<FixedWindowSnapshot> {
            Err(RateLimitError::transient("connection refused"))
        }

        async fn check_sliding(
            &self,
            _key: &str,
            _period: Duration,
            _limit: u64,
            _now_ms: u64,
        ) -> RateLimitResult<SlidingWindowSnapshot> {
            Err(RateLimitError::transient("connection refused"))
        }

        async fn check_bucket(
            &self,
            _key: &str,
            _capacity: u64,
            _refill_rate: f64,
            _period: Duration,
            _now_ms: u64,
            _cost: f64,
        ) -> RateLimitResult<TokenBucketSnapshot> {
            Err(RateLimitError::transient("connection refused"))
        }

        async fn peek(
            &self,
            _key: &str,
            _algorithm: Algorithm,
        ) -> RateLimitResult<PeekSnapshot> {
            Err(RateLimitError::transient("connection refused"))
        }

        async fn reset(&self, _key: &str) -> RateLimitResult<()> {
            Err(RateLimitError::transient("connection refused"))
        }

        async fn probe(&self) -> RateLimitResult<()> {
            Err(RateLimitError::transient("connection refused"))
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    fn memory(clock: Arc<ManualClock>) -> Arc<dyn RateLimitBackend> {
        MemoryBackend::new(
            MemoryBackendConfig {
                cleanup_interval: Duration::ZERO,
                ..Default::default()
            },
            clock,
        )
    }

    fn multi_down_then_memory(clock: Arc<ManualClock>) -> Arc<MultiBackend> {
        MultiBackend::new(
            vec![
                ("down".to_string(), Arc::new(DownBackend) as Arc<dyn RateLimitBackend>),
                ("memory".to_string(), memory(clock)),
            ],
            MultiStrategy::FirstHealthy,
            CircuitBreakerConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failover_to_second_backend() {
        let clock = Arc::new(ManualClock::at_secs(100));
        let multi = multi_down_then_memory(clock);

        let snap = multi
            .incr_fixed("k", Duration::from_secs(60), true)
            .await
            .unwrap();
        assert_eq!(snap.count, 1, "served by the healthy fallback");
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let clock = Arc::new(ManualClock::at_secs(100));
        let multi = multi_down_then_memory(clock);

        for _ in 0..6 {
            multi
                .incr_fixed("k", Duration::from_secs(60), true)
                .await
                .unwrap();
        }

        let status = multi.status();
        assert_eq!(status["down"].circuit, CircuitState::Open);
        assert!(!status["down"].healthy);
        assert!(status["memory"].healthy);

        let stats = multi.stats();
        assert_eq!(stats.total_backends, 2);
        assert_eq!(stats.available_backends, 1);
        assert_eq!(stats.strategy, "first_healthy");
    }

    #[tokio::test]
    async fn test_all_backends_down_is_unavailable() {
        let multi = MultiBackend::new(
            vec![
                ("a".to_string(), Arc::new(DownBackend) as Arc<dyn RateLimitBackend>),
                ("b".to_string(), Arc::new(DownBackend) as Arc<dyn RateLimitBackend>),
            ],
            MultiStrategy::FirstHealthy,
            CircuitBreakerConfig::default(),
        )
        .unwrap();

        let err = multi
            .incr_fixed("k", Duration::from_secs(60), true)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Unavailable));
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let clock = Arc::new(ManualClock::at_secs(100));
        let multi = MultiBackend::new(
            vec![
                ("m1".to_string(), memory(clock.clone())),
                ("m2".to_string(), memory(clock)),
            ],
            MultiStrategy::RoundRobin,
            CircuitBreakerConfig::default(),
        )
        .unwrap();

        // Two consecutive increments land on different children, so each
        // sees a fresh counter.
        let first = multi
            .incr_fixed("k", Duration::from_secs(60), true)
            .await
            .unwrap();
        let second = multi
            .incr_fixed("k", Duration::from_secs(60), true)
            .await
            .unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 1);
    }

    #[tokio::test]
    async fn test_empty_children_rejected() {
        let result = MultiBackend::new(
            Vec::new(),
            MultiStrategy::FirstHealthy,
            CircuitBreakerConfig::default(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_all_children() {
        let clock = Arc::new(ManualClock::at_secs(100));
        let multi = MultiBackend::new(
            vec![
                ("m1".to_string(), memory(clock.clone())),
                ("m2".to_string(), memory(clock)),
            ],
            MultiStrategy::RoundRobin,
            CircuitBreakerConfig::default(),
        )
        .unwrap();

        // Spread counters across both children, then reset.
        for _ in 0..4 {
            multi
                .incr_fixed("k", Duration::from_secs(60), true)
                .await
                .unwrap();
        }
        multi.reset("k").await.unwrap();

        let snap = multi
            .incr_fixed("k", Duration::from_secs(60), true)
            .await
            .unwrap();
        assert_eq!(snap.count, 1);
    }

    #[tokio::test]
    async fn test_probe_feeds_circuits() {
        let clock = Arc::new(ManualClock::at_secs(100));
        let multi = multi_down_then_memory(clock);

        assert!(multi.probe().await.is_ok(), "one healthy child is enough");

        for _ in 0..5 {
            let _ = multi.probe().await;
        }
        assert_eq!(multi.status()["down"].circuit, CircuitState::Open);
    }
}
