//! # Error Handling
//!
//! A single error enum for the library. Fire-and-forget paths (publishing,
//! auditing, scheduled jobs) log these errors instead of returning them.

use thiserror::Error;

/// Custom error types for NEOCORTEX operations.
#[derive(Debug, Error)]
pub enum NeocortexError {
    #[error("Store operation failed: {0}")]
    Store(String),
    #[error("Relay operation failed: {0}")]
    Relay(String),
    #[error("Scheduler error: {0}")]
    Scheduler(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Mail delivery failed: {0}")]
    Mail(String),
    #[error("Task handler failed: {0}")]
    Handler(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, NeocortexError>;
