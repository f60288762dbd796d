//! Cache change notifications and their consumers

use crate::models::EventKind;

/// A change applied to the cache
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<K> {
    /// Object appeared
    Add(K),
    /// Object replaced; carries the previous and the new state
    Update { old: K, new: K },
    /// Object removed; carries its last known state
    Delete(K),
}

impl<K> Notification<K> {
    /// Kind of change
    pub fn kind(&self) -> EventKind {
        match self {
            Notification::Add(_) => EventKind::Add,
            Notification::Update { .. } => EventKind::Update,
            Notification::Delete(_) => EventKind::Delete,
        }
    }

    /// The object as of this change (the new state for updates)
    pub fn object(&self) -> &K {
        match self {
            Notification::Add(obj) | Notification::Delete(obj) => obj,
            Notification::Update { new, .. } => new,
        }
    }
}

/// Receives changes applied by an [`Informer`](super::Informer)
///
/// Called synchronously on the informer task, so implementations must not block.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);

    fn on_update(&self, old: &K, new: &K);

    fn on_delete(&self, obj: &K);

    /// Route a notification to the matching callback
    fn dispatch(&self, notification: &Notification<K>) {
        match notification {
            Notification::Add(obj) => self.on_add(obj),
            Notification::Update { old, new } => self.on_update(old, new),
            Notification::Delete(obj) => self.on_delete(obj),
        }
    }
}
