//! Deduplicating work queue with delayed adds
//!
//! Keys move through three states: queued, delayed and in-flight. The queue
//! guarantees that a key is never handed to two consumers at once. Adding a
//! key that is already queued is a no-op; adding a key that is in-flight marks
//! it dirty so it is queued again as soon as the consumer calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A delayed entry waiting for its timer
#[derive(Debug, Clone, Copy)]
struct Waiting {
    ready_at: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready to be handed out, in FIFO order
    queue: VecDeque<String>,
    /// Keys that need processing (queued, or in-flight and re-added)
    dirty: HashSet<String>,
    /// Keys currently held by a consumer
    processing: HashSet<String>,
    /// Keys waiting out a delay
    waiting: HashMap<String, Waiting>,
    next_generation: u64,
    shutting_down: bool,
}

impl QueueState {
    /// Mark a key as needing work; returns true if it became available to `get`
    fn insert(&mut self, key: &str) -> bool {
        self.waiting.remove(key);

        if !self.dirty.insert(key.to_string()) {
            return false;
        }
        if self.processing.contains(key) {
            return false;
        }

        self.queue.push_back(key.to_string());
        true
    }

}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    item_ready: Notify,
    drained: Notify,
    shutdown: CancellationToken,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire_waiting(&self, key: &str, generation: u64) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }

        // A newer delay or a direct add superseded this timer
        match state.waiting.get(key) {
            Some(waiting) if waiting.generation == generation => {}
            _ => return,
        }

        let ready = state.insert(key);
        drop(state);

        trace!(queue = %self.name, key, "Delayed key is ready");
        if ready {
            self.item_ready.notify_one();
        }
    }
}

/// Deduplicating FIFO queue of string keys
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    /// Create a new named queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                item_ready: Notify::new(),
                drained: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing work
    ///
    /// No-op if the key is already queued or the queue is shutting down. A
    /// pending delayed add for the key is superseded.
    pub fn add(&self, key: &str) {
        let mut state = self.inner.lock();
        if state.shutting_down {
            trace!(queue = %self.inner.name, key, "Ignoring add after shutdown");
            return;
        }

        let ready = state.insert(key);
        drop(state);

        if ready {
            self.inner.item_ready.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed
    ///
    /// Must be called from within a Tokio runtime. If the key is already dirty
    /// (queued, or in-flight and re-added), or already waiting with an earlier
    /// deadline, this is a no-op.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        let generation = {
            let mut state = self.inner.lock();
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            if let Some(existing) = state.waiting.get(key) {
                if existing.ready_at <= ready_at {
                    return;
                }
            }

            let generation = state.next_generation;
            state.next_generation += 1;
            state.waiting.insert(
                key.to_string(),
                Waiting {
                    ready_at,
                    generation,
                },
            );
            generation
        };

        debug!(
            queue = %self.inner.name,
            key,
            delay_ms = delay.as_millis() as u64,
            "Delaying key"
        );

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => inner.fire_waiting(&key, generation),
                _ = inner.shutdown.cancelled() => {}
            }
        });
    }

    /// Wait for the next key
    ///
    /// The returned key is in-flight until [`WorkQueue::done`] is called.
    /// After shutdown the remaining keys are still handed out; `None` is
    /// returned once the queue is shut down and empty.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.item_ready.notified();
            {
                let mut state = self.inner.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release an in-flight key
    ///
    /// If the key was re-added while in-flight it is queued again, also
    /// during shutdown so the drain still delivers it.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.lock();
        state.processing.remove(key);

        let requeued = state.dirty.contains(key);
        if requeued {
            state.queue.push_back(key.to_string());
        }
        let drained = state.processing.is_empty();
        drop(state);

        if requeued {
            self.inner.item_ready.notify_one();
        }
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no key is ready to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently in-flight
    pub fn num_processing(&self) -> usize {
        self.inner.lock().processing.len()
    }

    /// Number of keys waiting out a delay
    pub fn num_waiting(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Stop accepting keys
    ///
    /// Adds and pending delays are dropped. Keys already queued are still
    /// handed out; after that, blocked and future `get` calls return `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.waiting.clear();
        }

        debug!(queue = %self.inner.name, "Work queue shutting down");
        self.inner.shutdown.cancel();
        self.inner.item_ready.notify_waiters();
    }

    /// Shut down and wait until every in-flight key has been released
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Whether `shut_down` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    // Test 1: Keys come out in FIFO order
    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("b");
        queue.add("c");

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert_eq!(queue.get().await.as_deref(), Some("c"));
    }

    // Test 2: Duplicate adds of a queued key collapse
    #[tokio::test]
    async fn test_duplicate_add_deduplicated() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("a");
        queue.add("a");

        assert_eq!(queue.len(), 1);
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    // Test 3: Add while in-flight is held until done
    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let queue = WorkQueue::new("test");
        queue.add("a");

        let key = queue.get().await.unwrap();
        queue.add("a");
        queue.add("a");

        // Not handed out while in-flight
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.num_processing(), 1);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    // Test 4: done without a re-add does not requeue
    #[tokio::test]
    async fn test_done_without_readd() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.done(&key);

        assert!(queue.is_empty());
        assert_eq!(queue.num_processing(), 0);
    }

    // Test 5: get blocks until an item is added
    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let queue = WorkQueue::new("test");
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.get().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        queue.add("late");
        let key = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(key.as_deref(), Some("late"));
    }

    // Test 6: Shutdown unblocks waiting consumers
    #[tokio::test]
    async fn test_shutdown_unblocks_get() {
        let queue = WorkQueue::new("test");
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let consumer = queue.clone();
                tokio::spawn(async move { consumer.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();

        for handle in handles {
            let result = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
            assert!(result.is_none());
        }
        assert!(queue.is_shutting_down());
    }

    // Test 7: Adds after shutdown are ignored
    #[tokio::test]
    async fn test_add_after_shutdown_ignored() {
        let queue = WorkQueue::new("test");
        queue.shut_down();
        queue.add("a");

        assert!(queue.is_empty());
        assert!(queue.get().await.is_none());
    }

    // Test 8: Delayed add becomes available after the delay
    #[tokio::test(start_paused = true)]
    async fn test_add_after_delay() {
        let queue = WorkQueue::new("test");
        queue.add_after("a", Duration::from_secs(5));

        assert!(queue.is_empty());
        assert_eq!(queue.num_waiting(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.num_waiting(), 0);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    // Test 9: Delayed add of a queued key is a no-op
    #[tokio::test(start_paused = true)]
    async fn test_add_after_of_queued_key_noop() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add_after("a", Duration::from_secs(1));

        assert_eq!(queue.num_waiting(), 0);
        assert_eq!(queue.len(), 1);
    }

    // Test 10: Direct add supersedes a pending delay
    #[tokio::test(start_paused = true)]
    async fn test_direct_add_supersedes_delay() {
        let queue = WorkQueue::new("test");
        queue.add_after("a", Duration::from_secs(10));
        queue.add("a");

        assert_eq!(queue.num_waiting(), 0);
        let key = queue.get().await.unwrap();
        queue.done(&key);

        // The superseded timer must not re-add the key
        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;
        assert!(queue.is_empty());
    }

    // Test 11: Earlier deadline wins for repeated delayed adds
    #[tokio::test(start_paused = true)]
    async fn test_earliest_delay_wins() {
        let queue = WorkQueue::new("test");
        queue.add_after("a", Duration::from_secs(10));
        queue.add_after("a", Duration::from_secs(2));
        queue.add_after("a", Duration::from_secs(5));

        assert_eq!(queue.num_waiting(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.unwrap();
        queue.done(&key);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(queue.is_empty());
    }

    // Test 12: Delayed add of an in-flight key lands after done
    #[tokio::test(start_paused = true)]
    async fn test_add_after_while_processing() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let key = queue.get().await.unwrap();

        queue.add_after("a", Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        // Fired while still in-flight: recorded as dirty, not handed out
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    // Test 13: shut_down_with_drain waits for in-flight keys
    #[tokio::test]
    async fn test_shutdown_with_drain() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let key = queue.get().await.unwrap();

        let drainer = queue.clone();
        let handle = tokio::spawn(async move { drainer.shut_down_with_drain().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        queue.done(&key);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    // Test 14: No key is handed to two consumers at once
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_concurrent_delivery() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let queue = WorkQueue::new("test");
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let violations = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let in_flight = Arc::clone(&in_flight);
                let violations = Arc::clone(&violations);
                let processed = Arc::clone(&processed);
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        if !in_flight.lock().unwrap().insert(key.clone()) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::task::yield_now().await;
                        in_flight.lock().unwrap().remove(&key);
                        processed.fetch_add(1, Ordering::SeqCst);
                        queue.done(&key);
                    }
                })
            })
            .collect();

        for round in 0..200 {
            queue.add(&format!("key-{}", round % 3));
            if round % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(processed.load(Ordering::SeqCst) >= 3);
    }

    // Test 15: Keys queued before shutdown are still delivered, then None
    #[tokio::test]
    async fn test_get_drains_queue_after_shutdown() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("b");
        queue.shut_down();
        queue.add("c");

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.get().await.is_none());
    }

    // Test 16: A dirty in-flight key is requeued on done during shutdown
    #[tokio::test]
    async fn test_dirty_key_requeued_during_shutdown() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add("a");
        queue.shut_down();

        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done("a");
        assert!(queue.get().await.is_none());
    }

    // Test 17: Delayed add of a dirty in-flight key is not recorded
    #[tokio::test(start_paused = true)]
    async fn test_add_after_of_dirty_in_flight_key_noop() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add("a");

        queue.add_after("a", Duration::from_secs(1));
        assert_eq!(queue.num_waiting(), 0);

        queue.done(&key);
        let key = queue.get().await.unwrap();

        // No leftover timer marks the key dirty during its next run
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        queue.done(&key);
        assert!(queue.is_empty());
        assert_eq!(queue.num_processing(), 0);
    }
}
