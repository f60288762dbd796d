//! Remote list+watch sources
//!
//! A source hands out a full snapshot of the collection and a stream of
//! incremental changes starting after a given resource version.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::SourceError;
use crate::models::{ObjectList, WatchEvent};

pub use http::HttpSource;
pub use memory::MemorySource;

/// Stream of changes returned by [`RemoteSource::watch`]
///
/// The stream may end, or yield an error, at any time.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, SourceError>>;

/// A remote collection consumed with list+watch
#[async_trait]
pub trait RemoteSource<K>: Send + Sync {
    /// Full snapshot of the collection and the version it was taken at
    async fn list(&self) -> Result<ObjectList<K>, SourceError>;

    /// Changes after `resource_version`
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, SourceError>;
}
