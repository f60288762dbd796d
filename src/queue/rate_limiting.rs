//! Work queue with per-key requeue backoff

use std::sync::Arc;
use std::time::Duration;

use super::rate_limiter::RateLimiter;
use super::work_queue::WorkQueue;

/// A [`WorkQueue`] whose failed keys come back after a limiter-chosen delay
#[derive(Clone)]
pub struct RateLimitingQueue {
    queue: WorkQueue,
    limiter: Arc<dyn RateLimiter>,
}

impl RateLimitingQueue {
    /// Wrap a new named queue with the given limiter
    pub fn new(name: impl Into<String>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            queue: WorkQueue::new(name),
            limiter,
        }
    }

    /// See [`WorkQueue::add`]
    pub fn add(&self, key: &str) {
        self.queue.add(key);
    }

    /// See [`WorkQueue::add_after`]
    pub fn add_after(&self, key: &str, delay: Duration) {
        self.queue.add_after(key, delay);
    }

    /// Requeue `key` after the limiter's delay; returns the delay used
    pub fn add_rate_limited(&self, key: &str) -> Duration {
        let delay = self.limiter.when(key);
        self.queue.add_after(key, delay);
        delay
    }

    /// Number of rate-limited requeues since `key` was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Clear the requeue history for `key`
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    /// See [`WorkQueue::get`]
    pub async fn get(&self) -> Option<String> {
        self.queue.get().await
    }

    /// See [`WorkQueue::done`]
    pub fn done(&self, key: &str) {
        self.queue.done(key);
    }

    /// See [`WorkQueue::len`]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// See [`WorkQueue::is_empty`]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// See [`WorkQueue::num_processing`]
    pub fn num_processing(&self) -> usize {
        self.queue.num_processing()
    }

    /// See [`WorkQueue::num_waiting`]
    pub fn num_waiting(&self) -> usize {
        self.queue.num_waiting()
    }

    /// See [`WorkQueue::shut_down`]
    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    /// See [`WorkQueue::shut_down_with_drain`]
    pub async fn shut_down_with_drain(&self) {
        self.queue.shut_down_with_drain().await;
    }

    /// See [`WorkQueue::is_shutting_down`]
    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}
