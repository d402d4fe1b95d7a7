//! Prefetch errors.
//!
//! Every variant means the image may not be warm on every node.

use std::time::Duration;

use faasgrid_cluster::ClusterError;
use thiserror::Error;

pub type PrefetchResult<T> = Result<T, PrefetchError>;

#[derive(Debug, Clone, Error)]
pub enum PrefetchError {
    #[error("failed to enumerate worker nodes: {0}")]
    Nodes(#[source] ClusterError),

    #[error("failed to create image puller {name:?}: {source}")]
    CreateDaemonSet { name: String, source: ClusterError },

    #[error("pod watch failed: {0}")]
    Watch(String),

    #[error("{image} ready on {ready}/{target} nodes after {after:?}")]
    Timeout {
        image: String,
        ready: usize,
        target: usize,
        after: Duration,
    },

    #[error("prefetch of {0} was cancelled")]
    Cancelled(String),

    #[error("failed to delete image puller {name:?}: {source}")]
    Teardown { name: String, source: ClusterError },
}
