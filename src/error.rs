//! Application error types for reconcile-controller
//!
//! This module defines common error types used throughout the application.
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by a remote list+watch source
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),

    /// Unexpected HTTP status
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Unauthorized
    #[error("Unauthorized")]
    Unauthorized,

    /// The requested resource version is too old to resume from
    #[error("Resource version expired: {0}")]
    Gone(String),

    /// A single event or payload could not be decoded
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// The watch stream was closed by the source
    #[error("Watch stream closed")]
    StreamClosed,

    /// Credentials could not be loaded
    #[error("Credentials error: {0}")]
    Credentials(String),
}

/// Cache/indexer errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    /// An index with this name is already registered
    #[error("Index already exists: {0}")]
    IndexExists(String),

    /// No index with this name is registered
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Key does not follow the `namespace/name` format
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Errors returned by a reconciliation handler
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandlerError {
    /// The handler could not reconcile the object
    #[error("Reconcile failed: {0}")]
    Failed(String),

    /// The handler task panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Cache lookup failed
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Controller lifecycle errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControllerError {
    /// The cache did not finish its initial listing in time
    #[error("Timed out after {0} seconds waiting for caches to sync")]
    SyncTimeout(u64),

    /// `run` was called on a controller that already left the Created state
    #[error("Controller already started")]
    AlreadyStarted,
}

/// Application-level error type
///
/// This is the main error type used throughout the application.
/// It aggregates all domain-specific error types.
#[derive(Debug, Error)]
pub enum AppError {
    /// Source error
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Handler error
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Controller error
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors
            SourceError::NetworkTimeout => true,
            SourceError::Network(_) => true,
            SourceError::ServerError(code) if *code >= 500 => true,
            SourceError::Gone(_) => true,
            SourceError::StreamClosed => true,
            SourceError::Malformed(_) => true,

            // Non-retryable errors
            SourceError::Unauthorized => false,
            SourceError::Credentials(_) => false,
            SourceError::ServerError(_) => false, // 4xx errors
        }
    }
}

impl RetryableError for HandlerError {
    fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Failed(_) => true,
            HandlerError::Panicked(_) => true,
            HandlerError::Cache(CacheError::InvalidKey(_)) => false,
            HandlerError::Cache(_) => true,
        }
    }
}
