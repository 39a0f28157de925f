//! Controller-specific error types.
//!
//! Remote failures are carried as `ContextError`; this enum adds what only the
//! cluster controller itself can get wrong.

use context_client::ContextError;
use thiserror::Error;

/// Errors that can occur in the Multi-DC Cluster Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Remote context error
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// Invalid controller configuration (environment)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object delivered by the watcher without name or namespace
    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether retrying the same pass can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Context(e) => e.is_transient() || e.is_not_found(),
            _ => false,
        }
    }
}
