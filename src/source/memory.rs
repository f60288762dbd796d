//! In-process list+watch source
//!
//! Keeps a collection in memory, stamps every change with a monotonically
//! increasing revision and replays its change log to new watchers. Useful for
//! tests and for embedding the controller in front of local state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{RemoteSource, WatchStream};
use crate::cache::key_for;
use crate::error::SourceError;
use crate::models::{ObjectList, Resource, WatchEvent};

type WatchItem<K> = Result<WatchEvent<K>, SourceError>;

struct MemoryState<K> {
    objects: BTreeMap<String, K>,
    revision: u64,
    /// Revisions at or below this were dropped from the log
    compacted: u64,
    log: Vec<(u64, WatchEvent<K>)>,
    watchers: Vec<UnboundedSender<WatchItem<K>>>,
    list_failures: u32,
}

/// In-memory [`RemoteSource`]
pub struct MemorySource<K> {
    state: Mutex<MemoryState<K>>,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl<K: Resource> MemorySource<K> {
    /// Create an empty source at revision 0
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                revision: 0,
                compacted: 0,
                log: Vec::new(),
                watchers: Vec::new(),
                list_failures: 0,
            }),
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace an object; returns the revision it was stamped with
    pub fn upsert(&self, mut obj: K) -> String {
        let mut state = self.lock();
        state.revision += 1;
        let revision = state.revision.to_string();
        obj.metadata_mut().resource_version = revision.clone();

        let key = key_for(&obj);
        let event = if state.objects.contains_key(&key) {
            WatchEvent::Modified(obj.clone())
        } else {
            WatchEvent::Added(obj.clone())
        };
        state.objects.insert(key, obj);
        Self::publish(&mut state, event);

        revision
    }

    /// Delete the object stored under `key`; returns false if absent
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.lock();
        let Some(mut obj) = state.objects.remove(key) else {
            return false;
        };

        state.revision += 1;
        obj.metadata_mut().resource_version = state.revision.to_string();
        Self::publish(&mut state, WatchEvent::Deleted(obj));
        true
    }

    /// Publish an event verbatim, without stamping a new revision
    ///
    /// The collection is updated to match. Lets callers replay duplicates
    /// such as a modification carrying an unchanged resource version.
    pub fn emit(&self, event: WatchEvent<K>) {
        let mut state = self.lock();
        let key = key_for(event.object());
        match &event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                state.objects.insert(key, obj.clone());
            }
            WatchEvent::Deleted(_) => {
                state.objects.remove(&key);
            }
        }
        Self::publish(&mut state, event);
    }

    fn publish(state: &mut MemoryState<K>, event: WatchEvent<K>) {
        let revision = state.revision;
        state
            .watchers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
        state.log.push((revision, event));
    }

    /// Send an error to every open watch stream
    pub fn inject_error(&self, error: SourceError) {
        self.lock()
            .watchers
            .retain(|tx| tx.send(Err(error.clone())).is_ok());
    }

    /// End every open watch stream
    pub fn disconnect_watchers(&self) {
        let mut state = self.lock();
        debug!(watchers = state.watchers.len(), "Disconnecting watchers");
        state.watchers.clear();
    }

    /// Drop the change log; watches from older revisions fail with Gone
    pub fn compact(&self) {
        let mut state = self.lock();
        state.compacted = state.revision;
        state.log.clear();
    }

    /// Make the next `count` list calls fail
    pub fn fail_next_lists(&self, count: u32) {
        self.lock().list_failures = count;
    }

    /// Current revision of the collection
    pub fn revision(&self) -> String {
        self.lock().revision.to_string()
    }

    /// Number of open watch streams
    pub fn num_watchers(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|tx| !tx.is_closed());
        state.watchers.len()
    }

    /// Number of list calls served so far, failed ones included
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of watch calls served so far
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }
}

impl<K: Resource> Default for MemorySource<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: Resource> RemoteSource<K> for MemorySource<K> {
    async fn list(&self) -> Result<ObjectList<K>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(SourceError::Network("injected list failure".to_string()));
        }

        Ok(ObjectList {
            resource_version: state.revision.to_string(),
            items: state.objects.values().cloned().collect(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, SourceError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);

        let from = if resource_version.is_empty() {
            0
        } else {
            resource_version.parse::<u64>().map_err(|_| {
                SourceError::Malformed(format!("Invalid resource version: {}", resource_version))
            })?
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            if from < state.compacted {
                return Err(SourceError::Gone(format!(
                    "Revision {} is older than {}",
                    from, state.compacted
                )));
            }

            for (_, event) in state.log.iter().filter(|(rev, _)| *rev > from) {
                // Receiver is alive, it is still in scope
                let _ = tx.send(Ok(event.clone()));
            }
            state.watchers.push(tx);
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
