//! Cluster access error types.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors returned by a [`ClusterApi`](crate::ClusterApi) implementation.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("conflicting update of {kind} {name:?}")]
    Conflict { kind: String, name: String },

    #[error("invalid label selector {0:?}")]
    Selector(String),

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("failed to configure cluster client: {0}")]
    Config(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}
