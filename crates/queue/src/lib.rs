//! Vigil work queue: deduplicating keys, per-key back-off, overall rate limit.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::hash::Hash;

mod queue;
pub mod rate_limit;

pub use queue::WorkQueue;
pub use rate_limit::{
    controller_rate_limiter, default_controller_rate_limiter, ExponentialBackoff, MaxOf, RateLimiter, TokenBucket,
};

/// Anything usable as a queue element.
pub trait QueueKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Debug + Send + Sync + 'static> QueueKey for T {}
