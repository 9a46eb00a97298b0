//! Reliability layer: circuit breakers and backend health monitoring.
//!
//! Each backend is guarded by a [`CircuitBreaker`] that short-circuits
//! calls after repeated failures, and a [`HealthMonitor`] that probes
//! backends in the background and feeds probe results into the circuits.

mod circuit_breaker;
mod health;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health::{BackendHealth, HealthMonitor, HealthState};
