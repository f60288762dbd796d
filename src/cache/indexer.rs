//! Thread-safe indexed object store
//!
//! The store maps keys to the latest known record and maintains any number
//! of secondary indices. Every mutation updates the primary map and all
//! indices under the same write lock, so readers never observe them out of
//! step.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::CacheError;
use crate::models::Resource;

/// Name of the built-in namespace index
pub const NAMESPACE_INDEX: &str = "namespace";

/// Function mapping an object to the index values it is filed under
pub type IndexFunc<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Index values for the namespace index
///
/// Cluster-scoped objects are filed under the empty string.
pub fn namespace_index<K: Resource>(obj: &K) -> Vec<String> {
    vec![obj.metadata().namespace.clone().unwrap_or_default()]
}

/// index value -> keys
type Index = HashMap<String, HashSet<String>>;

struct IndexerState<K> {
    items: HashMap<String, K>,
    index_funcs: HashMap<String, IndexFunc<K>>,
    indices: HashMap<String, Index>,
}

impl<K> IndexerState<K> {
    fn update_indices(&mut self, key: &str, old: Option<&K>, new: Option<&K>) {
        let IndexerState {
            index_funcs,
            indices,
            ..
        } = self;

        for (name, func) in index_funcs.iter() {
            let index = indices.entry(name.clone()).or_default();

            if let Some(old) = old {
                for value in func(old) {
                    if let Some(keys) = index.get_mut(&value) {
                        keys.remove(key);
                        if keys.is_empty() {
                            index.remove(&value);
                        }
                    }
                }
            }

            if let Some(new) = new {
                for value in func(new) {
                    index.entry(value).or_default().insert(key.to_string());
                }
            }
        }
    }

    fn rebuild_indices(&mut self) {
        let mut indices: HashMap<String, Index> = HashMap::new();
        for (name, func) in &self.index_funcs {
            let index = indices.entry(name.clone()).or_default();
            for (key, obj) in &self.items {
                for value in func(obj) {
                    index.entry(value).or_default().insert(key.clone());
                }
            }
        }
        self.indices = indices;
    }
}

/// In-memory mirror of the remote collection
///
/// Safe for concurrent callers. `put` and `delete` are idempotent with
/// respect to repeated identical calls.
pub struct Indexer<K> {
    state: RwLock<IndexerState<K>>,
}

impl<K: Resource> Indexer<K> {
    /// Create an empty store with no indices
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexerState {
                items: HashMap::new(),
                index_funcs: HashMap::new(),
                indices: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexerState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexerState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the latest record for a key
    pub fn get(&self, key: &str) -> Option<K> {
        self.read().items.get(key).cloned()
    }

    /// Store a record, returning the one it replaced
    pub fn put(&self, key: &str, obj: K) -> Option<K> {
        let mut state = self.write();
        let old = state.items.insert(key.to_string(), obj.clone());
        state.update_indices(key, old.as_ref(), Some(&obj));
        old
    }

    /// Remove a record, returning it if it was present
    pub fn delete(&self, key: &str) -> Option<K> {
        let mut state = self.write();
        let old = state.items.remove(key);
        if let Some(ref old) = old {
            state.update_indices(key, Some(old), None);
        }
        old
    }

    /// Swap the whole contents for a fresh listing
    ///
    /// Returns the previous contents so the caller can work out what vanished.
    pub fn replace(&self, items: Vec<(String, K)>) -> HashMap<String, K> {
        let mut state = self.write();
        let previous = std::mem::replace(&mut state.items, items.into_iter().collect());
        state.rebuild_indices();
        previous
    }

    /// All keys currently stored, sorted
    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().items.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// All records currently stored
    pub fn list(&self) -> Vec<K> {
        self.read().items.values().cloned().collect()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.read().items.is_empty()
    }

    /// Register a secondary index
    ///
    /// Records already in the store are indexed immediately.
    pub fn add_index<F>(&self, name: &str, func: F) -> Result<(), CacheError>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let mut state = self.write();
        if state.index_funcs.contains_key(name) {
            return Err(CacheError::IndexExists(name.to_string()));
        }

        let func: IndexFunc<K> = Arc::new(func);
        let mut index = Index::new();
        for (key, obj) in &state.items {
            for value in func(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }

        state.index_funcs.insert(name.to_string(), func);
        state.indices.insert(name.to_string(), index);
        Ok(())
    }

    /// Keys filed under `value` in the named index, sorted
    pub fn index_keys(&self, name: &str, value: &str) -> Result<Vec<String>, CacheError> {
        let state = self.read();
        let index = state
            .indices
            .get(name)
            .ok_or_else(|| CacheError::IndexNotFound(name.to_string()))?;

        let mut keys: Vec<String> = index
            .get(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    /// Records filed under `value` in the named index
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<K>, CacheError> {
        let state = self.read();
        let index = state
            .indices
            .get(name)
            .ok_or_else(|| CacheError::IndexNotFound(name.to_string()))?;

        Ok(index
            .get(value)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| state.items.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl<K: Resource> Default for Indexer<K> {
    fn default() -> Self {
        Self::new()
    }
}
