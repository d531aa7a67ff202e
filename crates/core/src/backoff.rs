//! Exponential back-off arithmetic shared by the work queue and the informer.

use std::time::Duration;

/// `base * 2^attempt`, capped at `max`.
pub fn exponential_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(max)
}

/// Stateful back-off for one retrying loop (e.g. a watch reconnect).
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), attempt: 0 }
    }

    /// Delay to wait before the next attempt; each call doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let d = exponential_delay(self.base, self.max, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        d
    }

    pub fn reset(&mut self) { self.attempt = 0; }

    pub fn attempt(&self) -> u32 { self.attempt }
}
