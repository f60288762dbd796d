//! reconcile-controller - Level-triggered reconciliation over a list+watch feed
//!
//! This crate keeps an indexed in-memory mirror of a remote object collection
//! and drives a pluggable handler for every changed object, with deduplicated,
//! rate-limited retries and a bounded worker pool.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod informer;
pub mod models;
pub mod otel;
pub mod queue;
pub mod source;
pub mod translator;
