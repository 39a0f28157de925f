//! Multi-context client errors

use crate::key::{ClusterKey, ObjectKind};
use thiserror::Error;

/// Errors that can occur when talking to a context's API server
#[derive(Debug, Error)]
pub enum ContextError {
    /// Object does not exist (yet)
    #[error("{kind} {key} not found")]
    NotFound { kind: ObjectKind, key: ClusterKey },

    /// Create raced with another writer
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ObjectKind, key: ClusterKey },

    /// Context name is not part of the configured contexts
    #[error("Unknown context: {0}")]
    UnknownContext(String),

    /// Endpoint unreachable, overloaded, conflicting write or any other
    /// failure that is expected to clear on its own
    #[error("Transient error on context {context}: {message}")]
    Transient { context: String, message: String },

    /// Kubeconfig could not be loaded
    #[error("Kubernetes configuration error: {0}")]
    Config(String),

    /// Object could not be converted to or from its wire form
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ContextError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContextError::NotFound { .. })
    }

    /// Whether the caller should requeue rather than surface a failure
    pub fn is_transient(&self) -> bool {
        matches!(self, ContextError::Transient { .. } | ContextError::AlreadyExists { .. })
    }

    /// Maps a kube API error for `kind` at `key`
    pub fn from_kube(err: kube::Error, kind: ObjectKind, key: &ClusterKey) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => ContextError::NotFound {
                kind,
                key: key.clone(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                ContextError::AlreadyExists { kind, key: key.clone() }
            }
            other => ContextError::Transient {
                context: key.context.clone(),
                message: format!("{} {}: {}", kind, key, other),
            },
        }
    }
}
