//! Cache notifications to queue keys
//!
//! The translator is the bridge between the informer and the work queue: it
//! reduces every change to the object's key and enqueues it. Handlers later
//! read the current state from the cache, so the payload is not carried.

use tracing::debug;

use crate::cache::key_for;
use crate::informer::ResourceEventHandler;
use crate::models::Resource;
use crate::queue::RateLimitingQueue;

/// Enqueues the key of every changed object
#[derive(Clone)]
pub struct EventTranslator {
    queue: RateLimitingQueue,
    suppress_unchanged_updates: bool,
}

impl EventTranslator {
    /// Create a translator feeding `queue`
    ///
    /// With `suppress_unchanged_updates`, updates whose resource version did
    /// not change are not enqueued.
    pub fn new(queue: RateLimitingQueue, suppress_unchanged_updates: bool) -> Self {
        Self {
            queue,
            suppress_unchanged_updates,
        }
    }

    fn enqueue<K: Resource>(&self, kind: &str, obj: &K) {
        let key = key_for(obj);
        debug!(key = %key, kind, "Enqueueing key");
        self.queue.add(&key);
    }
}

impl<K: Resource> ResourceEventHandler<K> for EventTranslator {
    fn on_add(&self, obj: &K) {
        self.enqueue("add", obj);
    }

    fn on_update(&self, old: &K, new: &K) {
        if self.suppress_unchanged_updates && old.resource_version() == new.resource_version() {
            debug!(
                key = %key_for(new),
                resource_version = new.resource_version(),
                "Skipping update with unchanged resource version"
            );
            return;
        }
        self.enqueue("update", new);
    }

    fn on_delete(&self, obj: &K) {
        self.enqueue("delete", obj);
    }
}
