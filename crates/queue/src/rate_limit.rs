//! Rate limiters deciding how long a key waits before it is retried.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use vigil_core::backoff::exponential_delay;

use crate::QueueKey;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;
/// Longest wait a token bucket hands out, however deep its deficit.
pub const MAX_TOKEN_WAIT: Duration = DEFAULT_MAX_DELAY;

pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be handed out again. Counts as one more failure for per-key limiters.
    fn when(&self, key: &K) -> Duration;
    /// Drop any back-off state for `key`.
    fn forget(&self, key: &K);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key exponential back-off: `base * 2^failures`, capped at `max`.
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: QueueKey> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: QueueKey> Default for ExponentialBackoff<K> {
    fn default() -> Self { Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY) }
}

impl<K: QueueKey> RateLimiter<K> for ExponentialBackoff<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        exponential_delay(self.base, self.max, exp)
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every key: `qps` refill rate, `burst` capacity.
///
/// A non-positive or non-finite `qps` leaves the bucket with almost no refill; every wait
/// past the burst is then [`MAX_TOKEN_WAIT`].
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let qps = if qps.is_finite() { qps.max(f64::MIN_POSITIVE) } else { f64::MIN_POSITIVE };
        Self { qps, burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    /// Reserve one token and return how long the caller must wait for it.
    fn reserve(&self) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst);
        b.last = now;
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            return Duration::ZERO;
        }
        // Debt never exceeds one capped wait.
        let floor = -MAX_TOKEN_WAIT.as_secs_f64() * self.qps;
        if b.tokens <= floor {
            b.tokens = floor;
            return MAX_TOKEN_WAIT;
        }
        Duration::try_from_secs_f64(-b.tokens / self.qps).map_or(MAX_TOKEN_WAIT, |d| d.min(MAX_TOKEN_WAIT))
    }
}

impl<K> RateLimiter<K> for TokenBucket {
    fn when(&self, _key: &K) -> Duration { self.reserve() }
    fn forget(&self, _key: &K) {}
    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Combines limiters: waits for the slowest, forgets in all.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters { l.forget(key); }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential back-off combined with an overall token bucket.
pub fn controller_rate_limiter<K: QueueKey>(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOf<K> {
    MaxOf::new(vec![
        Box::new(ExponentialBackoff::new(base, max)),
        Box::new(TokenBucket::new(qps, burst)),
    ])
}

/// 5ms..1000s per-key back-off, 10 qps / 100 burst overall.
pub fn default_controller_rate_limiter<K: QueueKey>() -> MaxOf<K> {
    controller_rate_limiter(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
}
