use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::rate_limit::{default_controller_rate_limiter, RateLimiter};
use crate::QueueKey;

/// Stand-in ready time for delays too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A key parked until `ready_at`. Ordered by time, then insertion.
struct Waiting<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}
impl<K> Eq for Waiting<K> {}
impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at.cmp(&other.ready_at).then(self.seq.cmp(&other.seq))
    }
}

struct State<K> {
    /// FIFO of keys ready to be handed out. Every key here is also in `dirty`.
    queue: VecDeque<K>,
    /// Keys that need processing.
    dirty: FxHashSet<K>,
    /// Keys currently held by a worker.
    processing: FxHashSet<K>,
    added_at: FxHashMap<K, Instant>,
    started_at: FxHashMap<K, Instant>,
    waiting: BinaryHeap<Reverse<Waiting<K>>>,
    /// Earliest pending ready time per delayed key; heap entries that disagree are stale.
    ready_at: FxHashMap<K, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl<K: QueueKey> State<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            added_at: FxHashMap::default(),
            started_at: FxHashMap::default(),
            waiting: BinaryHeap::new(),
            ready_at: FxHashMap::default(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the key became visible to `get`.
    fn insert(&mut self, key: K, now: Instant) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            // Re-queued by `done`.
            return false;
        }
        self.added_at.insert(key.clone(), now);
        self.queue.push_back(key);
        true
    }

    /// Move every due delayed key into the queue; returns how many became visible.
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        loop {
            let due = matches!(self.waiting.peek(), Some(Reverse(w)) if w.ready_at <= now);
            if !due {
                break;
            }
            let Some(Reverse(w)) = self.waiting.pop() else { break };
            if self.ready_at.get(&w.key) != Some(&w.ready_at) {
                continue;
            }
            self.ready_at.remove(&w.key);
            if self.insert(w.key, now) {
                promoted += 1;
            }
        }
        promoted
    }
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    item_ready: Notify,
    waiting_changed: Notify,
    delay_loop_started: AtomicBool,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deduplicating, rate-limited queue of keys.
///
/// A key is never handed to two callers of [`WorkQueue::get`] at once: it stays
/// in-flight until [`WorkQueue::done`]. Adding a key that is in-flight marks it
/// dirty, and it is queued again once `done` is called, no matter how many adds
/// arrived meanwhile.
///
/// Cloning yields another handle to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K: QueueKey> WorkQueue<K> {
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::new()),
                item_ready: Notify::new(),
                waiting_changed: Notify::new(),
                delay_loop_started: AtomicBool::new(false),
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Queue with the default controller rate limiter.
    pub fn with_default_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str { &self.inner.name }

    pub fn add(&self, key: K) {
        let queued = {
            let mut st = self.inner.lock();
            if st.shutting_down {
                return;
            }
            let queued = st.insert(key, Instant::now());
            gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name.clone());
            queued
        };
        counter!("workqueue_adds_total", 1u64, "name" => self.inner.name.clone());
        if queued {
            self.inner.item_ready.notify_one();
        }
    }

    /// Add `key` once `delay` has passed. Of several pending delays for one key the earliest wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if !self.ensure_delay_loop() {
            warn!(queue = %self.inner.name, ?key, "no async runtime for delayed add; adding now");
            self.add(key);
            return;
        }
        let now = Instant::now();
        let ready_at = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
        {
            let mut st = self.inner.lock();
            if st.shutting_down {
                return;
            }
            if matches!(st.ready_at.get(&key), Some(t) if *t <= ready_at) {
                return;
            }
            st.ready_at.insert(key.clone(), ready_at);
            st.seq += 1;
            let seq = st.seq;
            st.waiting.push(Reverse(Waiting { ready_at, seq, key }));
        }
        self.inner.waiting_changed.notify_one();
    }

    /// Add `key` after the delay its rate limiter assigns.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        if self.inner.limiter.num_requeues(&key) > 1 {
            counter!("workqueue_retries_total", 1u64, "name" => self.inner.name.clone());
        }
        debug!(queue = %self.inner.name, ?key, delay_ms = delay.as_millis() as u64, "rate limited add");
        self.add_after(key, delay);
    }

    /// Reset back-off for `key`. Call on success or on a permanent failure.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Wait for the oldest ready key and mark it in-flight.
    ///
    /// Returns `None` once the queue is shutting down and nothing is left to drain.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.lock();
                if let Some(key) = st.queue.pop_front() {
                    let now = Instant::now();
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    if let Some(at) = st.added_at.remove(&key) {
                        histogram!("workqueue_queue_latency_ms", now.saturating_duration_since(at).as_secs_f64() * 1000.0, "name" => self.inner.name.clone());
                    }
                    st.started_at.insert(key.clone(), now);
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.inner.name.clone());
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight marker; a key re-added meanwhile becomes ready again.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut st = self.inner.lock();
            st.processing.remove(key);
            if let Some(at) = st.started_at.remove(key) {
                histogram!("workqueue_work_duration_ms", at.elapsed().as_secs_f64() * 1000.0, "name" => self.inner.name.clone());
            }
            if st.dirty.contains(key) {
                st.added_at.insert(key.clone(), Instant::now());
                st.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.item_ready.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting `get`.
    pub fn shut_down(&self) {
        {
            let mut st = self.inner.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            st.waiting.clear();
            st.ready_at.clear();
        }
        debug!(queue = %self.inner.name, "queue shutting down");
        self.inner.item_ready.notify_waiters();
        self.inner.waiting_changed.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool { self.inner.lock().shutting_down }

    /// Keys ready to be handed out (excludes in-flight and delayed keys).
    pub fn len(&self) -> usize { self.inner.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys waiting on a delay.
    #[doc(hidden)]
    pub fn delayed_len(&self) -> usize { self.inner.lock().ready_at.len() }

    fn ensure_delay_loop(&self) -> bool {
        if self.inner.delay_loop_started.load(AtomicOrdering::Acquire) {
            return true;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else { return false };
        if self.inner.delay_loop_started.swap(true, AtomicOrdering::AcqRel) {
            return true;
        }
        handle.spawn(delay_loop(Arc::clone(&self.inner)));
        true
    }
}

async fn delay_loop<K: QueueKey>(inner: Arc<Inner<K>>) {
    loop {
        let (promoted, next) = {
            let mut st = inner.lock();
            if st.shutting_down {
                break;
            }
            let promoted = st.promote_due(Instant::now());
            (promoted, st.waiting.peek().map(|Reverse(w)| w.ready_at))
        };
        for _ in 0..promoted {
            inner.item_ready.notify_one();
        }
        match next {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = inner.waiting_changed.notified() => {}
                }
            }
            None => inner.waiting_changed.notified().await,
        }
    }
    debug!(queue = %inner.name, "delay loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::ExponentialBackoff;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new("test", ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("a".into());
        q.add("a".into());
        q.add("b".into());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_is_requeued_once_on_done() {
        let q = queue();
        q.add("a".into());
        let k = q.get().await.unwrap();
        q.add("a".into());
        q.add("a".into());
        q.add("a".into());
        // Held by a worker: not visible yet.
        assert_eq!(q.len(), 0);
        q.done(&k);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn done_without_readd_drops_key() {
        let q = queue();
        q.add("a".into());
        let k = q.get().await.unwrap();
        q.done(&k);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let q = queue();
        q.add("a".into());
        q.shut_down();
        q.add("b".into());
        assert!(q.is_shutting_down());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_delay_wins() {
        let q = queue();
        q.add_after("a".into(), Duration::from_secs(10));
        q.add_after("a".into(), Duration::from_secs(1));
        q.add_after("a".into(), Duration::from_secs(5));
        assert_eq!(q.delayed_len(), 1);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.delayed_len(), 0);
        let k = q.get().await.unwrap();
        q.done(&k);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn oversized_delay_parks_the_key() {
        let q = queue();
        q.add_after("a".into(), Duration::MAX);
        assert_eq!(q.delayed_len(), 1);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_after_zero_is_immediate() {
        let q = queue();
        q.add_after("a".into(), Duration::ZERO);
        assert_eq!(q.len(), 1);
    }
}
