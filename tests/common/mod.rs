//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use reconcile_controller::cache::{key_for, Indexer};
use reconcile_controller::config::{ControllerConfig, RetryConfig};
use reconcile_controller::controller::{Context, Controller, Handler};
use reconcile_controller::error::{ControllerError, HandlerError};
use reconcile_controller::models::{DynamicObject, ObjectMeta, Resource};
use reconcile_controller::queue::{ItemExponentialFailureRateLimiter, RateLimitingQueue};
use reconcile_controller::source::{MemorySource, RemoteSource};

/// Create a namespaced object with an empty body
pub fn pod(namespace: &str, name: &str) -> DynamicObject {
    DynamicObject::new(ObjectMeta::namespaced(namespace, name, ""))
}

/// What a handler saw in the cache when it ran
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: String,
    /// Resource version in the cache, `None` if the object was absent
    pub resource_version: Option<String>,
}

/// Handler that records what it finds in the cache
///
/// Can be told to fail or panic for specific keys, and detects overlapping
/// invocations for the same key.
pub struct RecordingHandler {
    cache: Arc<Indexer<DynamicObject>>,
    delay: Duration,
    observations: Mutex<Vec<Observation>>,
    in_flight: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    panic_once: Mutex<HashSet<String>>,
    pub overlaps: AtomicUsize,
}

impl RecordingHandler {
    pub fn new(cache: Arc<Indexer<DynamicObject>>) -> Self {
        Self::with_delay(cache, Duration::ZERO)
    }

    pub fn with_delay(cache: Arc<Indexer<DynamicObject>>, delay: Duration) -> Self {
        Self {
            cache,
            delay,
            observations: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            panic_once: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
        }
    }

    /// Always fail for `key`
    pub fn fail_key(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    /// Panic the next time `key` is handled
    pub fn panic_once(&self, key: &str) {
        self.panic_once.lock().unwrap().insert(key.to_string());
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().unwrap().clone()
    }

    pub fn observations_for(&self, key: &str) -> Vec<Observation> {
        self.observations()
            .into_iter()
            .filter(|o| o.key == key)
            .collect()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.observations_for(key).len()
    }

    pub fn last_for(&self, key: &str) -> Option<Observation> {
        self.observations_for(key).pop()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, key: &str) -> Result<(), HandlerError> {
        if !self.in_flight.lock().unwrap().insert(key.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let observation = Observation {
            key: key.to_string(),
            resource_version: self
                .cache
                .get(key)
                .map(|obj| obj.resource_version().to_string()),
        };
        self.observations.lock().unwrap().push(observation);
        self.in_flight.lock().unwrap().remove(key);

        let should_panic = self.panic_once.lock().unwrap().remove(key);
        if should_panic {
            panic!("handler panicked for {}", key);
        }

        if self.failing.lock().unwrap().contains(key) {
            return Err(HandlerError::Failed(format!("{} is failing", key)));
        }
        Ok(())
    }
}

/// Relist without delay
pub fn no_backoff() -> RetryConfig {
    RetryConfig {
        initial_backoff_secs: 0,
        max_backoff_secs: 0,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Queue with millisecond-scale retry backoff
pub fn fast_queue() -> RateLimitingQueue {
    RateLimitingQueue::new(
        "test",
        Arc::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
        )),
    )
}

/// A controller wired to an in-memory source and a recording handler
pub struct Harness {
    pub source: Arc<MemorySource<DynamicObject>>,
    pub cache: Arc<Indexer<DynamicObject>>,
    pub handler: Arc<RecordingHandler>,
    pub controller: Arc<Controller<DynamicObject>>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(config: ControllerConfig, relist: RetryConfig) -> Self {
        Self::with_handler_delay(config, relist, Duration::ZERO)
    }

    pub fn with_handler_delay(config: ControllerConfig, relist: RetryConfig, delay: Duration) -> Self {
        let source = Arc::new(MemorySource::new());
        let cache = Arc::new(Indexer::new());
        let handler = Arc::new(RecordingHandler::with_delay(Arc::clone(&cache), delay));

        let ctx = Context::new(Arc::clone(&cache), fast_queue(), handler.clone());
        let remote: Arc<dyn RemoteSource<DynamicObject>> = source.clone();
        let controller = Arc::new(Controller::new(remote, ctx, &config, relist));

        Self {
            source,
            cache,
            handler,
            controller,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the controller in the background
    pub fn start(&self, workers: usize) -> JoinHandle<Result<(), ControllerError>> {
        let controller = Arc::clone(&self.controller);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { controller.run(workers, cancel).await })
    }

    /// `(key, resource version)` of every object at the source, sorted by key
    pub async fn source_snapshot(&self) -> Vec<(String, String)> {
        let mut snapshot: Vec<(String, String)> = self
            .source
            .list()
            .await
            .expect("memory source list failed")
            .items
            .iter()
            .map(|obj| (key_for(obj), obj.resource_version().to_string()))
            .collect();
        snapshot.sort();
        snapshot
    }

    /// `(key, resource version)` of every cached object, sorted by key
    pub fn cache_snapshot(&self) -> Vec<(String, String)> {
        let mut snapshot: Vec<(String, String)> = self
            .cache
            .list()
            .iter()
            .map(|obj| (key_for(obj), obj.resource_version().to_string()))
            .collect();
        snapshot.sort();
        snapshot
    }

    /// Cancel and wait for the controller to return
    pub async fn stop(&self, handle: JoinHandle<Result<(), ControllerError>>) {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("controller did not stop in time")
            .expect("controller task panicked");
        assert!(result.is_ok(), "controller returned {:?}", result);
    }
}

/// Poll `condition` until it holds, failing after five seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}
