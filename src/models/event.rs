//! Change events emitted by a watch stream

use serde::{Deserialize, Serialize};

use super::object::Resource;

/// Kind of change carried by a watch event or cache notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Object was created
    Add,
    /// Object was modified
    Update,
    /// Object was removed
    Delete,
}

impl EventKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

/// One incremental change from the remote source
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Object was created
    Added(K),
    /// Object was modified
    Modified(K),
    /// Object was removed; carries its last known state
    Deleted(K),
}

impl<K: Resource> WatchEvent<K> {
    /// The object this event refers to
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    /// Kind of change
    pub fn kind(&self) -> EventKind {
        match self {
            WatchEvent::Added(_) => EventKind::Add,
            WatchEvent::Modified(_) => EventKind::Update,
            WatchEvent::Deleted(_) => EventKind::Delete,
        }
    }
}
