//! Circuit breaker around a single backend.
//!
//! ## States
//!
//! - **Closed**: normal operation; failures are counted in a sliding window
//! - **Open**: the backend is presumed down; calls are rejected immediately
//! - **Half-open**: after the open duration one probe call may test recovery
//!
//! A successful half-open probe closes the circuit; a failed one reopens
//! it. Transient failures count once in the window, protocol failures
//! twice.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through normally.
    Closed,
    /// Requests are rejected without touching the backend.
    Open,
    /// One probe call may test whether the backend recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerConfig {
    /// Weighted failures in the window before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub open_duration: Duration,
    /// Sliding window over which failures are counted.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    /// `(when, weight)` of each failure still inside the window.
    failures: Vec<(Instant, u32)>,
}

/// Per-backend failure gate.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    /// Probe slots consumed while half-open; at most one passes.
    half_open_probes: AtomicU32,
}

impl CircuitBreaker {
    /// Create a circuit breaker guarding the named backend.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Arc<Self> {
        let name = name.into();
        debug!(
            backend = %name,
            failure_threshold = config.failure_threshold,
            open_duration = ?config.open_duration,
            "Circuit breaker initialized"
        );
        Arc::new(Self {
            name,
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                failures: Vec::new(),
            }),
            half_open_probes: AtomicU32::new(0),
        })
    }

    /// The guarded backend's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, advancing open → half-open when the open duration
    /// has elapsed.
    pub fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open();
        self.inner.read().state
    }

    /// Whether a call may go through right now. In the half-open state the
    /// first caller claims the single probe slot; everyone else is
    /// rejected until the probe resolves.
    pub fn acquire(&self) -> bool {
        self.maybe_transition_to_half_open();
        match self.inner.read().state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => self.half_open_probes.fetch_add(1, Ordering::SeqCst) == 0,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let state = self.inner.read().state;
        match state {
            CircuitState::Closed => {
                let mut inner = self.inner.write();
                inner.failures.clear();
            }
            CircuitState::HalfOpen => self.close(),
            CircuitState::Open => {}
        }
    }

    /// Record a failed call with the given weight (1 transient, 2 fatal).
    pub fn record_failure(&self, weight: u32) {
        if weight == 0 {
            return;
        }
        let now = Instant::now();
        let state = self.inner.read().state;
        match state {
            CircuitState::Closed => {
                let mut inner = self.inner.write();
                // checked_sub: early in process life `now` may be closer to
                // the monotonic epoch than the window is wide.
                let window_start = now.checked_sub(self.config.failure_window);
                inner
                    .failures
                    .retain(|(t, _)| window_start.map_or(true, |ws| *t > ws));
                inner.failures.push((now, weight));
                let total: u32 = inner.failures.iter().map(|(_, w)| w).sum();
                if total >= self.config.failure_threshold {
                    drop(inner);
                    self.open();
                }
            }
            // A failed probe reopens the circuit for another full round.
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    /// Weighted failures currently inside the window.
    pub fn failures_in_window(&self) -> u32 {
        let window_start = Instant::now().checked_sub(self.config.failure_window);
        self.inner
            .read()
            .failures
            .iter()
            .filter(|(t, _)| window_start.map_or(true, |ws| *t > ws))
            .map(|(_, w)| w)
            .sum()
    }

    /// Force the circuit back to closed, clearing all failure history.
    pub fn reset(&self) {
        self.close();
    }

    fn open(&self) {
        let mut inner = self.inner.write();
        if inner.state != CircuitState::Open {
            warn!(backend = %self.name, "Circuit breaker opened");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            self.half_open_probes.store(0, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        let mut inner = self.inner.write();
        if inner.state != CircuitState::Closed {
            info!(backend = %self.name, "Circuit breaker closed");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.failures.clear();
            self.half_open_probes.store(0, Ordering::SeqCst);
        }
    }

    fn maybe_transition_to_half_open(&self) {
        {
            let inner = self.inner.read();
            if inner.state != CircuitState::Open {
                return;
            }
            match inner.opened_at {
                Some(at) if at.elapsed() >= self.config.open_duration => {}
                _ => return,
            }
        }

        let mut inner = self.inner.write();
        if inner.state == CircuitState::Open {
            debug!(backend = %self.name, "Circuit breaker half-open");
            inner.state = CircuitState::HalfOpen;
            self.half_open_probes.store(0, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.read().state)
            .field("failures_in_window", &self.failures_in_window())
            .finish()
    }
}
