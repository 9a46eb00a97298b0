//! In-memory rate limit backend.
//!
//! Uses DashMap for thread-safe concurrent access; the read-modify-write of
//! every operation happens under the map's entry lock, which serializes
//! concurrent callers per key. Suitable for single-instance deployments and
//! testing. For distributed deployments, use the Redis backend.
//!
//! Entries expire with their window (buckets live a full refill horizon
//! plus one period) and are swept by a background cleanup task. A size cap
//! triggers least-recently-touched eviction so a key flood cannot grow the
//! map without bound.

use crate::algorithms::Algorithm;
use crate::backend::{
    FixedWindowSnapshot, PeekSnapshot, RateLimitBackend, SlidingWindowSnapshot,
    TokenBucketSnapshot,
};
use crate::clock::Clock;
use crate::error::{RateLimitError, RateLimitResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Configuration for the in-memory backend.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryBackendConfig {
    /// Maximum tracked keys before LRU eviction kicks in.
    pub max_keys: usize,
    /// How often the background sweep removes expired entries. Zero
    /// disables the task (expired entries are still replaced lazily).
    pub cleanup_interval: Duration,
    /// Entries expiring within this horizon are protected from LRU
    /// eviction while non-active entries remain to drop.
    pub min_retain: Duration,
    /// How long `close` waits for the cleanup task to stop.
    pub shutdown_grace: Duration,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_keys: 10_000,
            cleanup_interval: Duration::from_secs(30),
            min_retain: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Per-algorithm state stored in an entry.
#[derive(Debug, Clone)]
enum EntryState {
    Fixed {
        count: u64,
        window_start_ms: u64,
        period_ms: u64,
    },
    Sliding {
        log: VecDeque<u64>,
        period_ms: u64,
    },
    Bucket {
        tokens: f64,
        last_refill_ms: u64,
        capacity: u64,
        refill_rate: f64,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    state: EntryState,
    last_touched_ms: u64,
    expires_at_ms: u64,
}

/// In-memory rate limit backend.
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    config: MemoryBackendConfig,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
    shutdown: Notify,
    cleanup_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    name: String,
}

impl MemoryBackend {
    /// Create a new in-memory backend and start its cleanup task.
    ///
    /// Must be called from within a Tokio runtime unless
    /// `cleanup_interval` is zero.
    pub fn new(config: MemoryBackendConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        debug!(
            max_keys = config.max_keys,
            cleanup_interval = ?config.cleanup_interval,
            "Creating in-memory rate limit backend"
        );

        let backend = Arc::new(Self {
            entries: DashMap::new(),
            config,
            clock,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            cleanup_task: parking_lot::Mutex::new(None),
            name: "memory".to_string(),
        });

        if !backend.config.cleanup_interval.is_zero() {
            let task = tokio::spawn(Self::cleanup_loop(
                Arc::downgrade(&backend),
                backend.config.cleanup_interval,
            ));
            *backend.cleanup_task.lock() = Some(task);
        }

        backend
    }

    /// Create a backend with the default configuration and system clock.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(MemoryBackendConfig::default(), Arc::new(crate::clock::SystemClock))
    }

    /// Number of tracked keys (for monitoring and tests).
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    fn ensure_open(&self) -> RateLimitResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RateLimitError::Closed)
        } else {
            Ok(())
        }
    }

    /// Background sweep: drop expired entries every `interval`.
    ///
    /// Holds only a weak reference so dropping the backend stops the loop
    /// even without an explicit `close`.
    async fn cleanup_loop(backend: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            let Some(strong) = backend.upgrade() else {
                break;
            };
            if strong.closed.load(Ordering::SeqCst) {
                break;
            }
            let shutdown = async { strong.shutdown.notified().await };
            tokio::select! {
                _ = shutdown => break,
                _ = ticker.tick() => {
                    strong.sweep_expired();
                }
            }
        }
    }

    fn sweep_expired(&self) {
        let now_ms = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms > now_ms);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept expired rate limit entries");
        }
    }

    /// Drop least-recently-touched entries until the map is back under 90%
    /// of the cap. Entries whose expiry is beyond `min_retain` are spared
    /// on the first pass so active windows survive a key flood; when
    /// nothing else is left, the oldest go anyway.
    fn maybe_evict(&self, now_ms: u64) {
        if self.entries.len() <= self.config.max_keys {
            return;
        }
        let target = self.config.max_keys * 9 / 10;
        let retain_horizon = now_ms + self.config.min_retain.as_millis() as u64;

        let mut candidates: Vec<(String, u64, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_touched_ms, e.value().expires_at_ms))
            .collect();
        candidates.sort_by_key(|(_, touched, _)| *touched);

        let mut evicted = 0usize;
        for (key, _, expires_at) in &candidates {
            if self.entries.len() <= target {
                break;
            }
            if *expires_at > retain_horizon {
                continue;
            }
            if self.entries.remove(key).is_some() {
                evicted += 1;
            }
        }
        // Not enough idle entries: drop the oldest active ones too.
        for (key, _, _) in &candidates {
            if self.entries.len() <= target {
                break;
            }
            if self.entries.remove(key).is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            warn!(
                evicted,
                remaining = self.entries.len(),
                max_keys = self.config.max_keys,
                "Evicted rate limit entries over key cap"
            );
        }
    }
}

#[async_trait]
impl RateLimitBackend for MemoryBackend {
    async fn incr_fixed(
        &self,
        key: &str,
        period: Duration,
        align_to_clock: bool,
    ) -> RateLimitResult<FixedWindowSnapshot> {
        self.ensure_open()?;

        let now_ms = self.clock.now_millis();
        let period_ms = period.as_millis() as u64;
        let fresh_start = |now_ms: u64| {
            if align_to_clock {
                (now_ms / period_ms) * period_ms
            } else {
                now_ms
            }
        };

        let snapshot = {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
                let window_start_ms = fresh_start(now_ms);
                Entry {
                    state: EntryState::Fixed {
                        count: 0,
                        window_start_ms,
                        period_ms,
                    },
                    last_touched_ms: now_ms,
                    expires_at_ms: window_start_ms + period_ms,
                }
            });

            // Roll over on expiry or on a non-fixed entry left under this key.
            let needs_reset = match &entry.state {
                EntryState::Fixed {
                    window_start_ms, ..
                } => now_ms >= window_start_ms + period_ms,
                _ => true,
            };
            if needs_reset {
                let window_start_ms = fresh_start(now_ms);
                entry.state = EntryState::Fixed {
                    count: 0,
                    window_start_ms,
                    period_ms,
                };
                entry.expires_at_ms = window_start_ms + period_ms;
            }

            entry.last_touched_ms = now_ms;
            let EntryState::Fixed {
                count,
                window_start_ms,
                ..
            } = &mut entry.state
            else {
                unreachable!("entry reset above guarantees fixed state");
            };
            *count += 1;
            let reset_at = (*window_start_ms + period_ms) / 1000;
            trace!(key = %key, count = *count, reset_at, "Fixed window increment");
            FixedWindowSnapshot {
                count: *count,
                reset_at,
            }
        };

        self.maybe_evict(now_ms);
        Ok(snapshot)
    }

    async fn check_sliding(
        &self,
        key: &str,
        period: Duration,
        limit: u64,
        now_ms: u64,
    ) -> RateLimitResult<SlidingWindowSnapshot> {
        self.ensure_open()?;

        let period_ms = period.as_millis() as u64;
        let cutoff = now_ms.saturating_sub(period_ms);

        let snapshot = {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                state: EntryState::Sliding {
                    log: VecDeque::new(),
                    period_ms,
                },
                last_touched_ms: now_ms,
                expires_at_ms: now_ms + period_ms,
            });

            if !matches!(entry.state, EntryState::Sliding { .. }) {
                entry.state = EntryState::Sliding {
                    log: VecDeque::new(),
                    period_ms,
                };
            }
            entry.last_touched_ms = now_ms;
            entry.expires_at_ms = now_ms + period_ms;

            let EntryState::Sliding { log, .. } = &mut entry.state else {
                unreachable!("entry reset above guarantees sliding state");
            };

            while log.front().is_some_and(|ts| *ts < cutoff) {
                log.pop_front();
            }

            let current = log.len() as u64;
            let admitted = current < limit;
            if admitted {
                log.push_back(now_ms);
            }
            let count = log.len() as u64;
            let oldest = log.front().copied().unwrap_or(now_ms);
            let reset_at = (oldest + period_ms).div_ceil(1000);

            trace!(key = %key, count, admitted, "Sliding window check");
            SlidingWindowSnapshot {
                count,
                reset_at,
                admitted,
            }
        };

        self.maybe_evict(now_ms);
        Ok(snapshot)
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
        self.ensure_open()?;

        // Entries live ceil(capacity / refill_rate) + period past the last
        // touch.
        let ttl_ms = (capacity as f64 / refill_rate).ceil() as u64 * 1000
            + period.as_millis() as u64;

        let snapshot = {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                state: EntryState::Bucket {
                    tokens: capacity as f64,
                    last_refill_ms: now_ms,
                    capacity,
                    refill_rate,
                },
                last_touched_ms: now_ms,
                expires_at_ms: now_ms + ttl_ms,
            });

            if !matches!(entry.state, EntryState::Bucket { .. }) {
                entry.state = EntryState::Bucket {
                    tokens: capacity as f64,
                    last_refill_ms: now_ms,
                    capacity,
                    refill_rate,
                };
            }
            entry.last_touched_ms = now_ms;
            entry.expires_at_ms = now_ms + ttl_ms;

            let EntryState::Bucket {
                tokens,
                last_refill_ms,
                capacity: stored_capacity,
                refill_rate: stored_rate,
            } = &mut entry.state
            else {
                unreachable!("entry reset above guarantees bucket state");
            };
            *stored_capacity = capacity;
            *stored_rate = refill_rate;

            let elapsed_secs = now_ms.saturating_sub(*last_refill_ms) as f64 / 1000.0;
            // Long-idle buckets reset to full instead of accumulating
            // float error over the gap.
            if elapsed_secs > 2.0 * capacity as f64 / refill_rate {
                *tokens = capacity as f64;
            } else {
                *tokens = (*tokens + elapsed_secs * refill_rate).min(capacity as f64);
            }
            *last_refill_ms = now_ms;

            let admitted = *tokens >= cost;
            if admitted {
                *tokens -= cost;
            }
            let reset_at =
                now_ms / 1000 + (((capacity as f64 - *tokens) / refill_rate).ceil() as u64);

            trace!(key = %key, tokens = *tokens, admitted, "Token bucket check");
            TokenBucketSnapshot {
                tokens: *tokens,
                reset_at,
                admitted,
            }
        };

        self.maybe_evict(now_ms);
        Ok(snapshot)
    }

    async fn peek(&self, key: &str, algorithm: Algorithm) -> RateLimitResult<PeekSnapshot> {
        self.ensure_open()?;

        let now_ms = self.clock.now_millis();
        let now_secs = now_ms / 1000;
        let Some(entry) = self.entries.get(key) else {
            return Ok(PeekSnapshot {
                level: 0.0,
                reset_at: now_secs,
            });
        };

        let snapshot = match (&entry.state, algorithm) {
            (
                EntryState::Fixed {
                    count,
                    window_start_ms,
                    period_ms,
                },
                Algorithm::FixedWindow,
            ) => {
                if now_ms >= window_start_ms + period_ms {
                    PeekSnapshot {
                        level: 0.0,
                        reset_at: now_secs,
                    }
                } else {
                    PeekSnapshot {
                        level: *count as f64,
                        reset_at: (*window_start_ms + *period_ms) / 1000,
                    }
                }
            }
            (EntryState::Sliding { log, period_ms }, Algorithm::SlidingWindow) => {
                let cutoff = now_ms.saturating_sub(*period_ms);
                let live = log.iter().filter(|ts| **ts >= cutoff).count();
                let oldest = log.iter().copied().find(|ts| *ts >= cutoff);
                PeekSnapshot {
                    level: live as f64,
                    reset_at: oldest
                        .map(|ts| (ts + period_ms).div_ceil(1000))
                        .unwrap_or(now_secs),
                }
            }
            (
                EntryState::Bucket {
                    tokens,
                    last_refill_ms,
                    capacity,
                    refill_rate,
                },
                Algorithm::TokenBucket,
            ) => {
                let elapsed_secs = now_ms.saturating_sub(*last_refill_ms) as f64 / 1000.0;
                let level = (tokens + elapsed_secs * refill_rate).min(*capacity as f64);
                PeekSnapshot {
                    level,
                    reset_at: now_secs
                        + (((*capacity as f64 - level) / refill_rate).ceil() as u64),
                }
            }
            _ => PeekSnapshot {
                level: 0.0,
                reset_at: now_secs,
            },
        };
        Ok(snapshot)
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.ensure_open()?;
        debug!(key = %key, "Resetting rate limit state");
        self.entries.remove(key);
        Ok(())
    }

    async fn probe(&self) -> RateLimitResult<()> {
        self.ensure_open()
    }

    async fn close(&self) -> RateLimitResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing in-memory rate limit backend");
        // notify_one stores a permit, so the loop stops even if it is
        // sitting in a tick rather than awaiting the notification.
        self.shutdown.notify_one();
        self.shutdown.notify_waiters();

        let task = self.cleanup_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(self.config.shutdown_grace, task)
                .await
                .is_err()
            {
                warn!("Cleanup task did not stop within the shutdown grace period");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("keys", &self.entries.len())
            .field("max_keys", &self.config.max_keys)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
