//! End-to-end scenarios against the public facade: the three algorithms
//! under a hand-driven clock, failover between backends, fail-open and
//! fail-closed behavior, and concurrency properties.

use async_trait::async_trait;
use ratewarden::backend::{
    FixedWindowSnapshot, PeekSnapshot, SlidingWindowSnapshot, TokenBucketSnapshot,
};
use ratewarden::{
    Algorithm, CircuitBreakerConfig, CircuitState, KeySource, ManualClock, MemoryBackend,
    MemoryBackendConfig, Policy, RateLimitBackend, RateLimitError, RateLimitResult, RateLimiter,
    Reason, RequestInfo,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A backend that can be switched between healthy (delegating to memory)
/// and down (transient failures), counting the calls it actually serves.
struct FlakyBackend {
    inner: Arc<MemoryBackend>,
    healthy: AtomicBool,
    served: AtomicU64,
}

impl FlakyBackend {
    fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBackend::new(
                MemoryBackendConfig {
                    cleanup_interval: Duration::ZERO,
                    ..Default::default()
                },
                clock,
            ),
            healthy: AtomicBool::new(true),
            served: AtomicU64::new(0),
        })
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> RateLimitResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RateLimitError::transient("connection refused"))
        }
    }
}

#[async_trait]
impl RateLimitBackend for FlakyBackend {
    async fn incr_fixed(
        &self,
        key: &str,
        period: Duration,
        align_to_clock: bool,
    ) -> RateLimitResult<FixedWindowSnapshot> {
        self.check_up()?;
        self.served.fetch_add(1, Ordering::SeqCst);
        self.inner.incr_fixed(key, period, align_to_clock).await
    }

    async fn check_sliding(
        &self,
        key: &str,
        period: Duration,
        limit: u64,
        now_ms: u64,
    ) -> RateLimitResult<SlidingWindowSnapshot> {
        self.check_up()?;
        self.served.fetch_add(1, Ordering::SeqCst);
        self.inner.check_sliding(key, period, limit, now_ms).await
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
        self.check_up()?;
        self.served.fetch_add(1, Ordering::SeqCst);
        self.inner
            .check_bucket(key, capacity, refill_rate, period, now_ms, cost)
            .await
    }

    async fn peek(&self, key: &str, algorithm: Algorithm) -> RateLimitResult<PeekSnapshot> {
        self.check_up()?;
        self.inner.peek(key, algorithm).await
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        self.check_up()?;
        self.inner.reset(key).await
    }

    async fn probe(&self) -> RateLimitResult<()> {
        self.check_up()
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// A backend whose calls hang long enough to blow any deadline.
struct SlowBackend;

#[async_trait]
impl RateLimitBackend for SlowBackend {
    async fn incr_fixed(
        &self,
        _key: &str,
        _period: Duration,
        _align_to_clock: bool,
    ) -> RateLimitResult<FixedWindowSnapshot> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(FixedWindowSnapshot {
            count: 1,
            reset_at: 0,
        })
    }

    async fn check_sliding(
        &self,
        _key: &str,
        _period: Duration,
        _limit: u64,
        _now_ms: u64,
    ) -> RateLimitResult<SlidingWindowSnapshot> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(SlidingWindowSnapshot {
            count: 1,
            reset_at: 0,
            admitted: true,
        })
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
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(TokenBucketSnapshot {
            tokens: 0.0,
            reset_at: 0,
            admitted: true,
        })
    }

    async fn peek(&self, _key: &str, _algorithm: Algorithm) -> RateLimitResult<PeekSnapshot> {
        Ok(PeekSnapshot {
            level: 0.0,
            reset_at: 0,
        })
    }

    async fn reset(&self, _key: &str) -> RateLimitResult<()> {
        Ok(())
    }

    async fn probe(&self) -> RateLimitResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "slow"
    }
}

async fn memory_limiter(clock: Arc<ManualClock>) -> RateLimiter {
    RateLimiter::builder()
        .clock(clock)
        .memory_backend(MemoryBackendConfig {
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        })
        .health_check_interval(Duration::ZERO)
        .build()
        .await
        .unwrap()
}

// Four requests in one aligned minute: three admitted, the fourth denied,
// all reporting the same window end.
#[tokio::test]
async fn fixed_window_scenario() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let limiter = memory_limiter(clock.clone()).await;
    let policy = Policy::new("3/m").unwrap().align_to_clock(true);

    let mut decisions = Vec::new();
    for _ in 0..4 {
        decisions.push(limiter.check_literal(&policy, "k").await.unwrap());
        clock.advance_secs(1);
    }

    let allowed: Vec<bool> = decisions.iter().map(|d| d.allowed).collect();
    assert_eq!(allowed, [true, true, true, false]);

    let remaining: Vec<u64> = decisions.iter().map(|d| d.remaining).collect();
    assert_eq!(remaining, [2, 1, 0, 0]);

    for decision in &decisions {
        assert_eq!(decision.limit, 3);
        assert_eq!(decision.reset_at, 60);
    }
}

// Sliding window 2/10s at t = 0, 1, 5, 11: the third request still sees
// both earlier entries, the fourth arrives after the first slid out.
#[tokio::test]
async fn sliding_window_scenario() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let limiter = memory_limiter(clock.clone()).await;
    let policy = Policy::new("2/10s")
        .unwrap()
        .algorithm(Algorithm::SlidingWindow);

    let mut allowed = Vec::new();
    for t in [0u64, 1, 5, 11] {
        clock.set_millis(t * 1000);
        allowed.push(limiter.check_literal(&policy, "k").await.unwrap().allowed);
    }
    assert_eq!(allowed, [true, true, false, true]);
}

// Full bucket of 5 at 1 token/sec: burst of five admitted, the sixth just
// after is denied, one more token is back by t = 1.5s.
#[tokio::test]
async fn token_bucket_scenario() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let limiter = memory_limiter(clock.clone()).await;
    let policy = Policy::new("5/m").unwrap().token_bucket(5, 1.0);

    for _ in 0..5 {
        assert!(limiter.check_literal(&policy, "k").await.unwrap().allowed);
    }

    clock.set_millis(100);
    assert!(!limiter.check_literal(&policy, "k").await.unwrap().allowed);

    clock.set_millis(1_500);
    assert!(limiter.check_literal(&policy, "k").await.unwrap().allowed);
}

// Failover: the remote backend fails transiently until its circuit opens,
// the memory backend serves everything in between, and a successful probe
// after the open duration brings the remote back.
#[tokio::test]
async fn failover_and_recovery_scenario() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let remote = FlakyBackend::new(clock.clone());
    let limiter = RateLimiter::builder()
        .clock(clock.clone())
        .custom_backend("remote", remote.clone())
        .memory_backend(MemoryBackendConfig {
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        })
        .circuit(CircuitBreakerConfig {
            failure_threshold: 5,
            open_duration: Duration::from_millis(100),
            failure_window: Duration::from_secs(60),
        })
        .health_check_interval(Duration::ZERO)
        .build()
        .await
        .unwrap();
    let policy = Policy::new("100/m").unwrap();

    // Remote down: every check still succeeds via the memory fallback and
    // never raises to the caller.
    remote.set_healthy(false);
    for _ in 0..6 {
        let decision = limiter.check_literal(&policy, "k").await.unwrap();
        assert!(decision.allowed);
    }
    let status = limiter.backend_status().unwrap();
    assert_eq!(status["remote"].circuit, CircuitState::Open);

    // With the circuit open the remote is not even tried.
    let before = remote.served();
    for _ in 0..3 {
        assert!(limiter.check_literal(&policy, "k").await.unwrap().allowed);
    }
    assert_eq!(remote.served(), before);

    // Recovery: after the open duration a successful probe closes the
    // circuit and the remote serves again.
    remote.set_healthy(true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    limiter.probe_now().await;
    assert_eq!(
        limiter.backend_status().unwrap()["remote"].circuit,
        CircuitState::Closed
    );

    let before = remote.served();
    assert!(limiter.check_literal(&policy, "k").await.unwrap().allowed);
    assert_eq!(remote.served(), before + 1);
}

// A single dead backend with the default policy denies with FAIL_CLOSED.
#[tokio::test]
async fn fail_closed_scenario() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let remote = FlakyBackend::new(clock.clone());
    remote.set_healthy(false);

    let limiter = RateLimiter::builder()
        .clock(clock)
        .custom_backend("remote", remote)
        .health_check_interval(Duration::ZERO)
        .build()
        .await
        .unwrap();

    let policy = Policy::new("10/m").unwrap();
    let decision = limiter.check_literal(&policy, "k").await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Reason::FailClosed);
    assert_eq!(decision.remaining, 0);
}

// The same dead backend with fail_open admits instead.
#[tokio::test]
async fn fail_open_scenario() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let remote = FlakyBackend::new(clock.clone());
    remote.set_healthy(false);

    let limiter = RateLimiter::builder()
        .clock(clock)
        .custom_backend("remote", remote)
        .health_check_interval(Duration::ZERO)
        .build()
        .await
        .unwrap();

    let policy = Policy::new("10/m").unwrap().fail_open(true);
    let decision = limiter.check_literal(&policy, "k").await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason, Reason::FailOpen);
}

// Under concurrent load on one key the number of admissions is exactly the
// limit; no race admits more.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_are_exact() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let limiter = Arc::new(memory_limiter(clock).await);
    let policy = Policy::new("100/m").unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let limiter = limiter.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            let mut admitted = 0u64;
            for _ in 0..25 {
                if limiter.check_literal(&policy, "shared").await.unwrap().allowed {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 100, "exactly the limit may be admitted across tasks");
}

// Same property for the sliding window, which takes a different code path.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sliding_admissions_are_exact() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let limiter = Arc::new(memory_limiter(clock).await);
    let policy = Policy::new("40/m").unwrap().algorithm(Algorithm::SlidingWindow);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let limiter = limiter.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            let mut admitted = 0u64;
            for _ in 0..10 {
                if limiter.check_literal(&policy, "shared").await.unwrap().allowed {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 40);
}

// Remaining never goes negative and never exceeds the limit, across all
// algorithms and well past exhaustion.
#[tokio::test]
async fn remaining_is_always_in_range() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let limiter = memory_limiter(clock).await;

    let policies = [
        Policy::new("5/m").unwrap(),
        Policy::new("5/m").unwrap().algorithm(Algorithm::SlidingWindow),
        Policy::new("5/m").unwrap().token_bucket(5, 1.0),
    ];

    for (i, policy) in policies.iter().enumerate() {
        let key = format!("k{i}");
        for _ in 0..12 {
            let decision = limiter.check_literal(policy, &key).await.unwrap();
            assert!(decision.remaining <= decision.limit);
        }
    }
}

// A deadline that fires mid-call resolves through the failure mode and
// leaves the limiter fully usable; nothing deadlocks.
#[tokio::test]
async fn cancellation_is_safe() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let limiter = RateLimiter::builder()
        .clock(clock)
        .custom_backend("slow", Arc::new(SlowBackend))
        .memory_backend(MemoryBackendConfig {
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        })
        .health_check_interval(Duration::ZERO)
        .build()
        .await
        .unwrap();

    let policy = Policy::new("10/m").unwrap();
    let key = KeySource::literal("k");
    let info = RequestInfo::default();

    let decision = limiter
        .check_with_deadline(&policy, &key, &info, Duration::from_millis(20))
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Reason::FailClosed);

    let open = Policy::new("10/m").unwrap().fail_open(true);
    let decision = limiter
        .check_with_deadline(&open, &key, &info, Duration::from_millis(20))
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason, Reason::FailOpen);
}

// Selector-derived and literal keys that reduce to the same bytes share a
// counter through the full stack.
#[tokio::test]
async fn equivalent_keys_share_counters() {
    let clock = Arc::new(ManualClock::at_secs(0));
    let limiter = memory_limiter(clock).await;
    let policy = Policy::new("2/m").unwrap();

    let info = RequestInfo::new("/api", "GET")
        .with_ip("10.1.2.3".parse().unwrap());

    limiter
        .check(&policy, &KeySource::client_ip(), &info)
        .await
        .unwrap();
    limiter
        .check(&policy, &KeySource::literal("ip:10.1.2.3"), &info)
        .await
        .unwrap();

    let decision = limiter
        .check(&policy, &KeySource::client_ip(), &info)
        .await
        .unwrap();
    assert!(!decision.allowed, "both shapes counted against one key");
}
