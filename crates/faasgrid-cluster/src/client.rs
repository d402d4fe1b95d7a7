//! [`ClusterApi`] over a real API server.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::api::{ClusterApi, ClusterObject, PodEvent, ServerVersion, object_name};
use crate::error::{ClusterError, ClusterResult};

/// Shared handle to the API server. Clones share the connection pool.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect using in-cluster configuration or the local kubeconfig,
    /// bounding every request by `timeout`.
    pub async fn connect(timeout: Duration) -> ClusterResult<Self> {
        let mut config = Config::infer()
            .await
            .map_err(|e| ClusterError::Config(e.to_string()))?;
        config.read_timeout = Some(timeout);
        config.write_timeout = Some(timeout);
        config.connect_timeout = Some(timeout);

        info!(cluster_url = %config.cluster_url, "connecting to cluster");
        let client = Client::try_from(config).map_err(|e| ClusterError::Config(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn namespaced<K: ClusterObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate a kube error into a [`ClusterError`] about `name` of kind `K`.
fn map_err<K: ClusterObject>(name: &str, err: kube::Error) -> ClusterError {
    let kind = K::kind(&()).to_string();
    let name = name.to_string();
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound { kind, name },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists { kind, name }
        }
        kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict { kind, name },
        kube::Error::SerdeError(e) => ClusterError::Serialize(e.to_string()),
        other => ClusterError::Api(other.to_string()),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> ClusterResult<K> {
        self.namespaced::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| map_err::<K>(name, e))
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> ClusterResult<Vec<K>> {
        let params = ListParams::default().labels(selector);
        let list = self
            .namespaced::<K>(namespace)
            .list(&params)
            .await
            .map_err(|e| map_err::<K>(selector, e))?;
        Ok(list.items)
    }

    async fn create<K: ClusterObject>(&self, namespace: &str, object: &K) -> ClusterResult<K> {
        let name = object_name(object);
        debug!(kind = %K::kind(&()), %namespace, %name, "creating object");
        self.namespaced::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_err::<K>(name, e))
    }

    async fn replace<K: ClusterObject>(&self, namespace: &str, object: &K) -> ClusterResult<K> {
        let name = object_name(object);
        debug!(kind = %K::kind(&()), %namespace, %name, "replacing object");
        self.namespaced::<K>(namespace)
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|e| map_err::<K>(name, e))
    }

    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        debug!(kind = %K::kind(&()), %namespace, %name, "deleting object");
        self.namespaced::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_err::<K>(name, e))
    }

    async fn delete_collection<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> ClusterResult<usize> {
        let api = self.namespaced::<K>(namespace);
        let params = ListParams::default().labels(selector);
        let matching = api
            .list(&params)
            .await
            .map_err(|e| map_err::<K>(selector, e))?;

        let mut deleted = 0;
        for object in &matching.items {
            let name = object_name(object);
            match api.delete(name, &DeleteParams::background()).await {
                Ok(_) => deleted += 1,
                Err(e) => match map_err::<K>(name, e) {
                    ClusterError::NotFound { .. } => {}
                    other => return Err(other),
                },
            }
        }
        Ok(deleted)
    }

    async fn list_nodes(&self, selector: &str) -> ClusterResult<Vec<Node>> {
        let params = ListParams::default().labels(selector);
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&params)
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        Ok(nodes.items)
    }

    fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> BoxStream<'static, ClusterResult<PodEvent>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().labels(selector);
        watcher(api, config)
            .default_backoff()
            .map_err(|e| ClusterError::Watch(e.to_string()))
            .try_filter_map(|event| async move {
                Ok(match event {
                    watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                        Some(PodEvent::Applied(pod))
                    }
                    watcher::Event::Delete(pod) => Some(PodEvent::Deleted(pod)),
                    watcher::Event::Init | watcher::Event::InitDone => None,
                })
            })
            .boxed()
    }

    async fn server_version(&self) -> ClusterResult<ServerVersion> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        Ok(ServerVersion {
            git_version: info.git_version,
            platform: info.platform,
        })
    }
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("default_namespace", &self.client.default_namespace())
            .finish()
    }
}
