//! Time sources for rate limiting.
//!
//! All window math in this crate goes through the [`Clock`] trait so that
//! tests can drive time deterministically with [`ManualClock`] while
//! production uses [`SystemClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A wall-clock source with second and millisecond resolution.
///
/// Implementations must be monotonic per instance: `now_millis` never goes
/// backwards between two calls on the same clock.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time as Unix epoch seconds.
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }

    /// Current time as Unix epoch milliseconds.
    fn now_millis(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A hand-driven clock for tests.
///
/// Starts at an arbitrary epoch and only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Create a clock pinned at the given epoch milliseconds.
    pub fn at_millis(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Create a clock pinned at the given epoch seconds.
    pub fn at_secs(secs: u64) -> Self {
        Self::at_millis(secs * 1000)
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance_millis(&self, delta: u64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// Advance the clock by the given number of seconds.
    pub fn advance_secs(&self, delta: u64) {
        self.advance_millis(delta * 1000);
    }

    /// Jump the clock to an absolute epoch millisecond value.
    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
