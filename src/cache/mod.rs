//! Local mirror of the remote collection
//!
//! The [`Indexer`] holds the latest known record for every key and keeps
//! secondary indices consistent with it on every mutation.

pub mod indexer;
pub mod keys;

pub use indexer::{namespace_index, IndexFunc, Indexer, NAMESPACE_INDEX};
pub use keys::{key_for, meta_namespace_key, split_meta_namespace_key};
