//! Dedup key derivation
//!
//! Keys are `namespace/name` for namespaced objects and `name` otherwise.

use crate::error::CacheError;
use crate::models::{ObjectMeta, Resource};

/// Build the cache key for the given metadata
pub fn meta_namespace_key(meta: &ObjectMeta) -> String {
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, meta.name),
        _ => meta.name.clone(),
    }
}

/// Build the cache key for an object
pub fn key_for<K: Resource>(obj: &K) -> String {
    meta_namespace_key(obj.metadata())
}

/// Split a key back into its namespace and name
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str), CacheError> {
    let mut parts = key.split('/');
    let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => (None, name),
        (Some(ns), Some(name), None) => (Some(ns), name),
        _ => return Err(CacheError::InvalidKey(key.to_string())),
    };

    if name.is_empty() {
        return Err(CacheError::InvalidKey(key.to_string()));
    }

    Ok((namespace.filter(|ns| !ns.is_empty()), name))
}
