//! The cluster access contract.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ClusterResult;

/// A namespaced object type the cluster can store.
///
/// Blanket-implemented for every k8s-openapi type and every namespaced
/// `CustomResource`.
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Pod change delivered by [`ClusterApi::watch_pods`].
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// Added, modified, or seen during the initial listing.
    Applied(Pod),
    Deleted(Pod),
}

impl PodEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Applied(pod) | PodEvent::Deleted(pod) => pod,
        }
    }
}

/// API server identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub git_version: String,
    pub platform: String,
}

/// Typed CRUD over namespaced objects plus the few cluster-wide queries the
/// lifecycle engine and the prefetch engine need.
///
/// Implementations are cheap to clone and share one connection pool.
/// Selectors use the Kubernetes label-selector syntax (`a=b,!c`); an empty
/// selector matches everything.
#[async_trait]
pub trait ClusterApi: Clone + Debug + Send + Sync + 'static {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> ClusterResult<K>;

    async fn list<K: ClusterObject>(&self, namespace: &str, selector: &str)
    -> ClusterResult<Vec<K>>;

    async fn create<K: ClusterObject>(&self, namespace: &str, object: &K) -> ClusterResult<K>;

    /// Replace an existing object. A set `resourceVersion` makes the write
    /// conditional on it.
    async fn replace<K: ClusterObject>(&self, namespace: &str, object: &K) -> ClusterResult<K>;

    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    /// Delete every object matching `selector`, returning how many were removed.
    async fn delete_collection<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> ClusterResult<usize>;

    async fn list_nodes(&self, selector: &str) -> ClusterResult<Vec<Node>>;

    /// Stream pod changes in `namespace` matching `selector`. The stream
    /// starts with the current matching pods and ends when dropped.
    fn watch_pods(&self, namespace: &str, selector: &str)
    -> BoxStream<'static, ClusterResult<PodEvent>>;

    async fn server_version(&self) -> ClusterResult<ServerVersion>;
}

/// Name of an object, or an empty string when unset.
pub fn object_name<K: Resource>(object: &K) -> &str {
    object.meta().name.as_deref().unwrap_or_default()
}
