//! Shared state handed to the informer and the workers

use std::sync::Arc;

use super::handler::Handler;
use crate::cache::Indexer;
use crate::models::Resource;
use crate::otel::Metrics;
use crate::queue::RateLimitingQueue;

/// Cache, queue and handler of one controller
pub struct Context<K: Resource> {
    pub cache: Arc<Indexer<K>>,
    pub queue: RateLimitingQueue,
    pub handler: Arc<dyn Handler>,
    pub metrics: Option<Arc<Metrics>>,
}

impl<K: Resource> Context<K> {
    pub fn new(cache: Arc<Indexer<K>>, queue: RateLimitingQueue, handler: Arc<dyn Handler>) -> Self {
        Self {
            cache,
            queue,
            handler,
            metrics: None,
        }
    }

    /// Record controller metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl<K: Resource> Clone for Context<K> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            metrics: self.metrics.clone(),
        }
    }
}
