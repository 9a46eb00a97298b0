//! Background health monitoring for rate limit backends.
//!
//! A [`HealthMonitor`] owns the probe loop: every interval it calls
//! `probe()` on each registered backend, records the outcome, and feeds
//! the backend's circuit breaker. A successful probe against a half-open
//! circuit is what brings a recovered backend back into rotation.

use crate::backend::RateLimitBackend;
use crate::clock::Clock;
use crate::resilience::CircuitBreaker;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Consecutive probe failures before a backend is considered dead.
const DEAD_THRESHOLD: u32 = 3;

/// Probe-derived health of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Last probe succeeded.
    Healthy,
    /// Recent probes failed, but fewer than the dead threshold.
    Degraded,
    /// Probes have failed repeatedly.
    Dead,
}

impl HealthState {
    /// Whether the backend should still receive traffic.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Health record for one backend.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BackendHealth {
    /// Current assessment.
    pub state: HealthState,
    /// Probe failures since the last success.
    pub consecutive_failures: u32,
    /// When the backend was last probed (epoch seconds).
    pub last_probe_at: u64,
    /// When a probe last failed (epoch seconds), if ever.
    pub last_failure_at: Option<u64>,
}

struct HealthTarget {
    name: String,
    backend: Arc<dyn RateLimitBackend>,
    circuit: Arc<CircuitBreaker>,
}

/// Periodic prober feeding circuit breakers and the health map.
pub struct HealthMonitor {
    targets: Vec<HealthTarget>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    results: RwLock<HashMap<String, BackendHealth>>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor over the given `(name, backend, circuit)` triples.
    pub fn new(
        targets: Vec<(String, Arc<dyn RateLimitBackend>, Arc<CircuitBreaker>)>,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            targets: targets
                .into_iter()
                .map(|(name, backend, circuit)| HealthTarget {
                    name,
                    backend,
                    circuit,
                })
                .collect(),
            interval,
            clock,
            results: RwLock::new(HashMap::new()),
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Start the background probe loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.interval;
        *task = Some(tokio::spawn(Self::probe_loop(weak, interval)));
    }

    /// Stop the background probe loop.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn probe_loop(monitor: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(strong) = monitor.upgrade() else {
                break;
            };
            strong.probe_all().await;
        }
    }

    /// Probe every backend once, updating health records and circuits.
    pub async fn probe_all(&self) {
        for target in &self.targets {
            let now = self.clock.now_secs();
            let outcome = target.backend.probe().await;

            let mut results = self.results.write();
            let previous_failures = results
                .get(&target.name)
                .map(|h| h.consecutive_failures)
                .unwrap_or(0);

            let health = match &outcome {
                Ok(()) => BackendHealth {
                    state: HealthState::Healthy,
                    consecutive_failures: 0,
                    last_probe_at: now,
                    last_failure_at: results.get(&target.name).and_then(|h| h.last_failure_at),
                },
                Err(_) => {
                    let failures = previous_failures + 1;
                    BackendHealth {
                        state: if failures >= DEAD_THRESHOLD {
                            HealthState::Dead
                        } else {
                            HealthState::Degraded
                        },
                        consecutive_failures: failures,
                        last_probe_at: now,
                        last_failure_at: Some(now),
                    }
                }
            };
            results.insert(target.name.clone(), health);
            drop(results);

            match outcome {
                Ok(()) => {
                    debug!(backend = %target.name, "Health probe succeeded");
                    // Only a recovering circuit needs the good news; a
                    // closed one counts real traffic on its own.
                    if target.circuit.state() != crate::resilience::CircuitState::Closed {
                        target.circuit.record_success();
                    }
                }
                Err(err) => {
                    warn!(backend = %target.name, error = %err, "Health probe failed");
                    target.circuit.record_failure(err.failure_weight());
                }
            }
        }
    }

    /// Current health of every monitored backend.
    pub fn snapshot(&self) -> HashMap<String, BackendHealth> {
        self.results.read().clone()
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("targets", &self.targets.len())
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryBackendConfig};
    use crate::clock::ManualClock;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};

    fn memory_backend(clock: Arc<ManualClock>) -> Arc<MemoryBackend> {
        MemoryBackend::new(
            MemoryBackendConfig {
                cleanup_interval: Duration::ZERO,
                ..Default::default()
            },
            clock,
        )
    }

    #[tokio::test]
    async fn test_probe_reports_healthy() {
        let clock = Arc::new(ManualClock::at_secs(100));
        let backend = memory_backend(clock.clone());
        let circuit = CircuitBreaker::new("memory", CircuitBreakerConfig::default());
        let monitor = HealthMonitor::new(
            vec![("memory".to_string(), backend as Arc<dyn RateLimitBackend>, circuit)],
            Duration::from_secs(30),
            clock,
        );

        monitor.probe_all().await;
        let snapshot = monitor.snapshot();
        let health = snapshot.get("memory").unwrap();
        assert_eq!(health.state, HealthState::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.last_probe_at, 100);
    }

    #[tokio::test]
    async fn test_probe_degrades_then_kills_closed_backend() {
        let clock = Arc::new(ManualClock::at_secs(100));
        let backend = memory_backend(clock.clone());
        backend.close().await.unwrap();

        let circuit = CircuitBreaker::new("memory", CircuitBreakerConfig::default());
        let monitor = HealthMonitor::new(
            vec![("memory".to_string(), backend as Arc<dyn RateLimitBackend>, circuit.clone())],
            Duration::from_secs(30),
            clock,
        );

        monitor.probe_all().await;
        assert_eq!(
            monitor.snapshot().get("memory").unwrap().state,
            HealthState::Degraded
        );

        monitor.probe_all().await;
        monitor.probe_all().await;
        let health = monitor.snapshot();
        let health = health.get("memory").unwrap();
        assert_eq!(health.state, HealthState::Dead);
        assert_eq!(health.consecutive_failures, 3);
        assert!(health.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_successful_probe_recovers_half_open_circuit() {
        let clock = Arc::new(ManualClock::at_secs(100));
        let backend = memory_backend(clock.clone());
        let circuit = CircuitBreaker::new(
            "memory",
            CircuitBreakerConfig {
                failure_threshold: 1,
                open_duration: Duration::from_millis(20),
                ..Default::default()
            },
        );
        circuit.record_failure(1);
        assert_eq!(circuit.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let monitor = HealthMonitor::new(
            vec![("memory".to_string(), backend as Arc<dyn RateLimitBackend>, circuit.clone())],
            Duration::from_secs(30),
            clock,
        );
        monitor.probe_all().await;
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
