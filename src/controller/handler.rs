//! Reconciliation handlers

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::cache::{split_meta_namespace_key, Indexer};
use crate::error::HandlerError;
use crate::models::Resource;

/// Reconciles one object, identified by its key
///
/// Implementations must be idempotent: the same key may be handled again at
/// any time, including after the object was deleted. Read the current state
/// from the cache rather than trusting what triggered the call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, key: &str) -> Result<(), HandlerError>;
}

/// Handler that logs the cached state of each key
pub struct LoggingHandler<K: Resource> {
    cache: Arc<Indexer<K>>,
}

impl<K: Resource> LoggingHandler<K> {
    pub fn new(cache: Arc<Indexer<K>>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl<K: Resource> Handler for LoggingHandler<K> {
    async fn handle(&self, key: &str) -> Result<(), HandlerError> {
        let (namespace, name) = split_meta_namespace_key(key)?;

        match self.cache.get(key) {
            Some(obj) => info!(
                namespace = namespace.unwrap_or_default(),
                name,
                resource_version = obj.resource_version(),
                "Sync/Add/Update for object"
            ),
            None => info!(
                namespace = namespace.unwrap_or_default(),
                name,
                "Object does not exist anymore"
            ),
        }

        Ok(())
    }
}
