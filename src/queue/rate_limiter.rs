//! Requeue delay policies
//!
//! A rate limiter decides how long a failed key waits before it becomes
//! eligible again. Per-key limiters also track how many times each key has
//! been requeued so the worker pool can cap retries.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Policy computing requeue delays
pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be processed again; records one more requeue
    fn when(&self, key: &str) -> Duration;

    /// Number of requeues recorded for `key` since it was last forgotten
    fn num_requeues(&self, key: &str) -> u32;

    /// Reset the requeue history for `key`
    fn forget(&self, key: &str);
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    /// Create a limiter with the given base and cap
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Backoff for a key that has already failed `failures` times
    pub fn calculate_backoff(&self, failures: u32) -> Duration {
        let factor = 1u128.checked_shl(failures).unwrap_or(u128::MAX);
        let nanos = self
            .base_delay
            .as_nanos()
            .saturating_mul(factor)
            .min(self.max_delay.as_nanos());

        u64::try_from(nanos)
            .map(Duration::from_nanos)
            .unwrap_or(self.max_delay)
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.to_string()).or_insert(0);
        let backoff = self.calculate_backoff(*count);
        *count = count.saturating_add(1);
        backoff
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn forget(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Overall token bucket shared by every key
///
/// Bounds the aggregate requeue rate regardless of which keys fail.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a full bucket refilled at `qps` tokens per second
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &str) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;

        // Reserve a token; a negative balance is paid back over time
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }

    fn forget(&self, _key: &str) {}
}

/// Combines limiters by taking the longest delay
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    /// Create a combined limiter
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        // Every limiter must record the attempt, so no short-circuiting
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }

    fn forget(&self, key: &str) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }
}

/// Per-key exponential backoff combined with an overall token bucket
pub fn default_controller_rate_limiter(config: &RateLimitConfig) -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_secs(config.max_delay_secs),
        )),
        Box::new(BucketRateLimiter::new(config.qps, config.burst)),
    ])
}
