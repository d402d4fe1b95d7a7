//! The caller-facing error taxonomy.
//!
//! Drivers never surface cluster, store or compiler errors directly; they
//! convert into one of four stable kinds so routing layers can map them to
//! status codes regardless of the active backend.

use faasgrid_cluster::ClusterError;
use faasgrid_compiler::CompileError;
use faasgrid_prefetch::PrefetchError;
use faasgrid_state::StateError;
use thiserror::Error;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The descriptor was rejected before any cluster call.
    #[error("invalid {field}: {reason}")]
    InvalidResource { field: String, reason: String },

    #[error("{0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A later step failed after an earlier one committed.
    #[error("{operation} of service {service:?} partially failed: {source}")]
    PartialFailure {
        operation: &'static str,
        service: String,
        source: Box<BackendError>,
    },
}

/// Payload-free discriminant of [`BackendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidResource,
    NotFound,
    BackendUnavailable,
    PartialFailure,
}

impl BackendError {
    pub fn invalid(field: &str, reason: impl ToString) -> Self {
        BackendError::InvalidResource {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn partial(operation: &'static str, service: &str, source: BackendError) -> Self {
        BackendError::PartialFailure {
            operation,
            service: service.to_string(),
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::InvalidResource { .. } => ErrorKind::InvalidResource,
            BackendError::NotFound(_) => ErrorKind::NotFound,
            BackendError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            BackendError::PartialFailure { .. } => ErrorKind::PartialFailure,
        }
    }
}

impl From<ClusterError> for BackendError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound { .. } => BackendError::NotFound(err.to_string()),
            other => BackendError::BackendUnavailable(other.to_string()),
        }
    }
}

impl From<StateError> for BackendError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(_) => BackendError::NotFound(err.to_string()),
            StateError::Encode { .. } | StateError::Decode { .. } => {
                BackendError::invalid("metadata", err)
            }
            StateError::Cluster(e) => e.into(),
        }
    }
}

impl From<CompileError> for BackendError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::InvalidResource { field, reason } => {
                BackendError::InvalidResource { field, reason }
            }
        }
    }
}

impl From<PrefetchError> for BackendError {
    fn from(err: PrefetchError) -> Self {
        BackendError::BackendUnavailable(err.to_string())
    }
}
