//! Error types for the Metadata Record store.

use faasgrid_cluster::ClusterError;
use thiserror::Error;

/// Result type alias for Metadata Record operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("no registered metadata for service {0:?}")]
    NotFound(String),

    #[error("failed to encode metadata for {service:?}: {reason}")]
    Encode { service: String, reason: String },

    #[error("metadata for {service:?} is not decodable: {reason}")]
    Decode { service: String, reason: String },

    #[error(transparent)]
    Cluster(ClusterError),
}

impl From<ClusterError> for StateError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound { name, .. } => StateError::NotFound(name),
            other => StateError::Cluster(other),
        }
    }
}
