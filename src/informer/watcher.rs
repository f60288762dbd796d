//! List+watch loop feeding the cache

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::{Notification, ResourceEventHandler};
use crate::cache::{key_for, Indexer};
use crate::config::RetryConfig;
use crate::error::SourceError;
use crate::models::{Resource, WatchEvent};
use crate::otel::Metrics;
use crate::source::RemoteSource;

/// Keeps an [`Indexer`] synchronized with a [`RemoteSource`]
///
/// Lists the collection, then watches from the listed version. Whenever the
/// watch ends or fails the collection is listed again, with exponential
/// backoff between attempts. Every change is applied to the cache before the
/// handlers hear about it.
pub struct Informer<K: Resource> {
    source: Arc<dyn RemoteSource<K>>,
    cache: Arc<Indexer<K>>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    relist: RetryConfig,
    metrics: Option<Arc<Metrics>>,
    synced: watch::Sender<bool>,
}

impl<K: Resource> Informer<K> {
    /// Create an informer writing into `cache`
    pub fn new(source: Arc<dyn RemoteSource<K>>, cache: Arc<Indexer<K>>, relist: RetryConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            source,
            cache,
            handlers: Vec::new(),
            relist,
            metrics: None,
            synced,
        }
    }

    /// Register a handler for applied changes
    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// Record events and relists in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The cache this informer maintains
    pub fn cache(&self) -> &Arc<Indexer<K>> {
        &self.cache
    }

    /// Whether the first full listing has been applied
    ///
    /// Never reverts to false once true.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Receiver that observes `true` once the first listing has been applied
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Delay before relist attempt number `attempt` (zero-based)
    ///
    /// `initial_backoff * multiplier^attempt`, capped, with 50-100% jitter
    /// when enabled.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.relist.initial_backoff_secs as f64
            * self.relist.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.relist.max_backoff_secs as f64);

        let delay = if self.relist.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(delay.max(0.0))
            .unwrap_or(Duration::from_secs(self.relist.max_backoff_secs))
    }

    /// Run list+watch until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(handlers = self.handlers.len(), "Starting informer");
        let mut attempt = 0u32;

        loop {
            let listed = tokio::select! {
                _ = cancel.cancelled() => break,
                listed = self.list_and_replace() => listed,
            };

            match listed {
                Ok(resource_version) => {
                    attempt = 0;
                    match self.watch_from(&resource_version, &cancel).await {
                        Ok(()) => break,
                        Err(SourceError::StreamClosed) => {
                            info!(resource_version = %resource_version, "Watch closed, relisting");
                        }
                        Err(e) => {
                            warn!(error = %e, "Watch failed, relisting");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempt + 1, "List failed");
                }
            }

            let backoff = self.calculate_backoff(attempt);
            attempt = attempt.saturating_add(1);
            debug!(backoff_ms = backoff.as_millis() as u64, "Waiting before relist");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        info!("Informer stopped");
    }

    /// List the collection and swap it into the cache
    ///
    /// Listed keys are announced as updates if they were already cached and as
    /// adds otherwise. Keys that vanished since the previous listing are
    /// announced as deletes. Returns the version to watch from.
    async fn list_and_replace(&self) -> Result<String, SourceError> {
        let listed = self.source.list().await;
        if let Some(metrics) = &self.metrics {
            metrics.record_relist(listed.is_ok());
        }
        let list = listed?;

        let items: Vec<(String, K)> = list
            .items
            .into_iter()
            .map(|obj| (key_for(&obj), obj))
            .collect();
        let count = items.len();

        let mut previous = self.cache.replace(items.clone());
        for (key, obj) in items {
            match previous.remove(&key) {
                Some(old) => self.notify(Notification::Update { old, new: obj }),
                None => self.notify(Notification::Add(obj)),
            }
        }

        let mut vanished: Vec<(String, K)> = previous.into_iter().collect();
        vanished.sort_by(|a, b| a.0.cmp(&b.0));
        let removed = vanished.len();
        for (_, obj) in vanished {
            self.notify(Notification::Delete(obj));
        }

        if !self.synced.send_replace(true) {
            info!(objects = count, "Initial listing applied, cache synced");
        }
        debug!(
            objects = count,
            removed,
            resource_version = %list.resource_version,
            "Listed collection"
        );

        Ok(list.resource_version)
    }

    /// Apply watch events until the stream ends or fails; `Ok` only on cancellation
    async fn watch_from(
        &self,
        resource_version: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = self.source.watch(resource_version) => stream?,
        };

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                item = stream.next() => item,
            };

            match item {
                None => return Err(SourceError::StreamClosed),
                Some(Ok(event)) => self.apply(event),
                Some(Err(SourceError::Malformed(reason))) => {
                    warn!(reason = %reason, "Dropping malformed watch event");
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Apply one watch event to the cache, then notify
    ///
    /// An add or modify for a cached key is announced as an update; for an
    /// unknown key as an add. Deletes are announced even when the key was
    /// not cached.
    fn apply(&self, event: WatchEvent<K>) {
        let key = key_for(event.object());
        debug!(key = %key, kind = event.kind().as_str(), "Applying watch event");

        let notification = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                match self.cache.put(&key, obj.clone()) {
                    Some(old) => Notification::Update { old, new: obj },
                    None => Notification::Add(obj),
                }
            }
            WatchEvent::Deleted(obj) => {
                self.cache.delete(&key);
                Notification::Delete(obj)
            }
        };

        self.notify(notification);
    }

    fn notify(&self, notification: Notification<K>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_event(notification.kind());
        }
        for handler in &self.handlers {
            handler.dispatch(&notification);
        }
    }
}
