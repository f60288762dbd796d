//! Change feed consumer
//!
//! The [`Informer`] keeps a cache in step with a remote collection through
//! list+watch and forwards every applied change to its event handlers.

pub mod handler;
pub mod watcher;

pub use handler::{Notification, ResourceEventHandler};
pub use watcher::Informer;
