//! Domain models for reconcile-controller
//!
//! This module contains the object records mirrored from the remote source
//! and the change events the source emits.

pub mod event;
pub mod object;

// Re-export commonly used types
pub use event::{EventKind, WatchEvent};
pub use object::{DynamicObject, ObjectList, ObjectMeta, Resource};
