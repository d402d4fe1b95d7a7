//! In-process [`ClusterApi`] used by tests and the fake backend.
//!
//! Objects are stored as JSON keyed by type, namespace and name, so any
//! [`ClusterObject`] round-trips exactly as it would through the API
//! server. Writes bump a global `resourceVersion`; a replace carrying a
//! stale one fails with [`ClusterError::Conflict`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, Node, Pod, PodSpec, PodStatus, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector as MetaSelector, ObjectMeta};
use kube::Resource;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::api::{ClusterApi, ClusterObject, PodEvent, ServerVersion, object_name};
use crate::crd::Function;
use crate::error::{ClusterError, ClusterResult};
use crate::selector::LabelSelector;

/// Operation a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Replace,
    Delete,
    DeleteCollection,
    Watch,
}

type ObjectKey = (String, String, String);

struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    nodes: Vec<Node>,
    failures: HashSet<(String, Verb)>,
    resource_version: u64,
    openfaas_operator: bool,
    version: ServerVersion,
}

#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Mutex<Inner>>,
    pod_events: broadcast::Sender<PodEvent>,
}

fn type_key<K: Resource<DynamicType = ()>>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn not_found<K: ClusterObject>(name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: K::kind(&()).to_string(),
        name: name.to_string(),
    }
}

fn labels_of(value: &Value) -> BTreeMap<String, String> {
    value
        .pointer("/metadata/labels")
        .and_then(|l| serde_json::from_value(l.clone()).ok())
        .unwrap_or_default()
}

fn decode<K: ClusterObject>(value: &Value) -> ClusterResult<K> {
    serde_json::from_value(value.clone()).map_err(|e| ClusterError::Serialize(e.to_string()))
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("pod_watchers", &self.pod_events.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (pod_events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                nodes: Vec::new(),
                failures: HashSet::new(),
                resource_version: 0,
                openfaas_operator: false,
                version: ServerVersion {
                    git_version: "v1.32.0".to_string(),
                    platform: "linux/amd64".to_string(),
                },
            })),
            pod_events,
        }
    }

    /// Materialize a Deployment for every created OpenFaaS `Function`, the
    /// way the OpenFaaS operator does.
    pub async fn enable_openfaas_operator(&self) {
        self.inner.lock().await.openfaas_operator = true;
    }

    pub async fn set_server_version(&self, git_version: &str, platform: &str) {
        self.inner.lock().await.version = ServerVersion {
            git_version: git_version.to_string(),
            platform: platform.to_string(),
        };
    }

    /// Make every subsequent `verb` on objects of type `K` fail.
    pub async fn fail_on<K: ClusterObject>(&self, verb: Verb) {
        self.inner.lock().await.failures.insert((type_key::<K>(), verb));
    }

    pub async fn clear_failures(&self) {
        self.inner.lock().await.failures.clear();
    }

    pub async fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        self.inner.lock().await.nodes.push(node);
    }

    pub async fn contains<K: ClusterObject>(&self, namespace: &str, name: &str) -> bool {
        let key = (type_key::<K>(), namespace.to_string(), name.to_string());
        self.inner.lock().await.objects.contains_key(&key)
    }

    /// Number of stored objects of type `K` in `namespace`.
    pub async fn count<K: ClusterObject>(&self, namespace: &str) -> usize {
        let kind = type_key::<K>();
        self.inner
            .lock()
            .await
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .count()
    }

    /// Store or remove the pod carried by `event`, then publish it to every
    /// active [`watch_pods`](ClusterApi::watch_pods) stream.
    pub async fn emit_pod(&self, event: PodEvent) -> ClusterResult<()> {
        let pod = event.pod();
        let key = (
            type_key::<Pod>(),
            pod.metadata.namespace.clone().unwrap_or_default(),
            object_name(pod).to_string(),
        );
        {
            let mut inner = self.inner.lock().await;
            match &event {
                PodEvent::Applied(pod) => {
                    let value =
                        serde_json::to_value(pod).map_err(|e| ClusterError::Serialize(e.to_string()))?;
                    inner.objects.insert(key, value);
                }
                PodEvent::Deleted(_) => {
                    inner.objects.remove(&key);
                }
            }
        }
        // No receivers is fine.
        let _ = self.pod_events.send(event);
        Ok(())
    }

    async fn check(&self, kind: &str, verb: Verb) -> ClusterResult<()> {
        if self
            .inner
            .lock()
            .await
            .failures
            .contains(&(kind.to_string(), verb))
        {
            return Err(ClusterError::Api(format!("injected {verb:?} failure on {kind}")));
        }
        Ok(())
    }
}

/// A pod in `namespace` with the given labels and `status.phase`.
pub fn pod_in_phase(namespace: &str, name: &str, labels: &[(&str, &str)], phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The Deployment the OpenFaaS operator would derive from `function`.
fn operator_deployment(function: &Function) -> Deployment {
    let mut labels = function.spec.labels.clone();
    labels.insert("faas_function".to_string(), function.spec.name.clone());
    Deployment {
        metadata: ObjectMeta {
            name: Some(function.spec.name.clone()),
            namespace: function.metadata.namespace.clone(),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: MetaSelector {
                match_labels: Some(BTreeMap::from([(
                    "faas_function".to_string(),
                    function.spec.name.clone(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: function.spec.name.clone(),
                        image: Some(function.spec.image.clone()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl Inner {
    fn bump(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn insert<K: ClusterObject>(&mut self, namespace: &str, object: &K) -> ClusterResult<K> {
        let name = object_name(object).to_string();
        let key = (type_key::<K>(), namespace.to_string(), name.clone());
        if self.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: K::kind(&()).to_string(),
                name,
            });
        }
        let mut stored = object.clone();
        let meta = stored.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.resource_version = Some(self.bump());
        let value =
            serde_json::to_value(&stored).map_err(|e| ClusterError::Serialize(e.to_string()))?;
        self.objects.insert(key, value);
        Ok(stored)
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> ClusterResult<K> {
        let kind = type_key::<K>();
        self.check(&kind, Verb::Get).await?;
        let inner = self.inner.lock().await;
        let value = inner
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found::<K>(name))?;
        decode(value)
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> ClusterResult<Vec<K>> {
        let kind = type_key::<K>();
        self.check(&kind, Verb::List).await?;
        let selector = LabelSelector::parse(selector)?;
        let inner = self.inner.lock().await;
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), value)| {
                *k == kind && ns == namespace && selector.matches(&labels_of(value))
            })
            .map(|(_, value)| decode(value))
            .collect()
    }

    async fn create<K: ClusterObject>(&self, namespace: &str, object: &K) -> ClusterResult<K> {
        let kind = type_key::<K>();
        self.check(&kind, Verb::Create).await?;
        let mut inner = self.inner.lock().await;
        let created = inner.insert(namespace, object)?;
        debug!(%kind, %namespace, name = object_name(object), "stored object");

        if inner.openfaas_operator && kind == type_key::<Function>() {
            let value =
                serde_json::to_value(&created).map_err(|e| ClusterError::Serialize(e.to_string()))?;
            let function: Function = decode(&value)?;
            inner.insert(namespace, &operator_deployment(&function))?;
        }
        Ok(created)
    }

    async fn replace<K: ClusterObject>(&self, namespace: &str, object: &K) -> ClusterResult<K> {
        let kind = type_key::<K>();
        self.check(&kind, Verb::Replace).await?;
        let name = object_name(object).to_string();
        let key = (kind, namespace.to_string(), name.clone());

        let mut inner = self.inner.lock().await;
        let current = inner.objects.get(&key).ok_or_else(|| not_found::<K>(&name))?;
        let current_version = current
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(expected) = &object.meta().resource_version {
            if current_version.as_ref() != Some(expected) {
                return Err(ClusterError::Conflict {
                    kind: K::kind(&()).to_string(),
                    name,
                });
            }
        }

        let mut stored = object.clone();
        let meta = stored.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.resource_version = Some(inner.bump());
        let value =
            serde_json::to_value(&stored).map_err(|e| ClusterError::Serialize(e.to_string()))?;
        inner.objects.insert(key, value);
        Ok(stored)
    }

    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let kind = type_key::<K>();
        self.check(&kind, Verb::Delete).await?;
        let mut inner = self.inner.lock().await;
        if inner
            .objects
            .remove(&(kind.clone(), namespace.to_string(), name.to_string()))
            .is_none()
        {
            return Err(not_found::<K>(name));
        }
        // Garbage collection of the operator-owned Deployment.
        if inner.openfaas_operator && kind == type_key::<Function>() {
            inner
                .objects
                .remove(&(type_key::<Deployment>(), namespace.to_string(), name.to_string()));
        }
        Ok(())
    }

    async fn delete_collection<K: ClusterObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> ClusterResult<usize> {
        let kind = type_key::<K>();
        self.check(&kind, Verb::DeleteCollection).await?;
        let selector = LabelSelector::parse(selector)?;
        let mut inner = self.inner.lock().await;
        let before = inner.objects.len();
        inner.objects.retain(|(k, ns, _), value| {
            !(*k == kind && ns == namespace && selector.matches(&labels_of(value)))
        });
        Ok(before - inner.objects.len())
    }

    async fn list_nodes(&self, selector: &str) -> ClusterResult<Vec<Node>> {
        self.check(&type_key::<Node>(), Verb::List).await?;
        let selector = LabelSelector::parse(selector)?;
        let inner = self.inner.lock().await;
        Ok(inner
            .nodes
            .iter()
            .filter(|node| selector.matches(&node.metadata.labels.clone().unwrap_or_default()))
            .cloned()
            .collect())
    }

    fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> BoxStream<'static, ClusterResult<PodEvent>> {
        let selector = match LabelSelector::parse(selector) {
            Ok(selector) => selector,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let namespace = namespace.to_string();
        let receiver = self.pod_events.subscribe();
        let this = self.clone();

        let initial = {
            let namespace = namespace.clone();
            let selector = selector.clone();
            stream::once(async move {
                this.check(&type_key::<Pod>(), Verb::Watch)
                    .await
                    .map_err(|e| ClusterError::Watch(e.to_string()))?;
                let pods: Vec<Pod> = this.list(&namespace, "").await?;
                Ok::<_, ClusterError>(
                    pods.into_iter()
                        .filter(|pod| {
                            selector.matches(&pod.metadata.labels.clone().unwrap_or_default())
                        })
                        .map(PodEvent::Applied)
                        .collect::<Vec<_>>(),
                )
            })
        };

        let live = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| {
            let pod = event.pod();
            let keep = pod.metadata.namespace.as_deref() == Some(namespace.as_str())
                && selector.matches(&pod.metadata.labels.clone().unwrap_or_default());
            async move { keep }
        })
        .map(Ok);

        initial
            .flat_map(|snapshot| match snapshot {
                Ok(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .chain(live)
            .boxed()
    }

    async fn server_version(&self) -> ClusterResult<ServerVersion> {
        Ok(self.inner.lock().await.version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn config_map(name: &str, service: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "faasgrid_service".to_string(),
                    service.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_get_list_delete() {
        let cluster = MemoryCluster::new();
        cluster.create("ns", &config_map("a", "s1")).await.unwrap();
        cluster.create("ns", &config_map("b", "s2")).await.unwrap();
        cluster.create("other", &config_map("c", "s1")).await.unwrap();

        let got: ConfigMap = cluster.get("ns", "a").await.unwrap();
        assert_eq!(got.metadata.namespace.as_deref(), Some("ns"));
        assert!(got.metadata.resource_version.is_some());

        let listed: Vec<ConfigMap> = cluster.list("ns", "faasgrid_service=s1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(object_name(&listed[0]), "a");

        cluster.delete::<ConfigMap>("ns", "a").await.unwrap();
        let err = cluster.get::<ConfigMap>("ns", "a").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(cluster.delete::<ConfigMap>("ns", "a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let cluster = MemoryCluster::new();
        cluster.create("ns", &config_map("a", "s1")).await.unwrap();
        let err = cluster.create("ns", &config_map("a", "s1")).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let cluster = MemoryCluster::new();
        let first = cluster.create("ns", &config_map("a", "s1")).await.unwrap();
        let second = cluster.replace("ns", &first).await.unwrap();
        assert_ne!(first.metadata.resource_version, second.metadata.resource_version);

        let err = cluster.replace("ns", &first).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));

        // No resourceVersion means unconditional.
        let mut blind = config_map("a", "s1");
        blind.metadata.resource_version = None;
        cluster.replace("ns", &blind).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_are_per_type_and_verb() {
        let cluster = MemoryCluster::new();
        cluster.fail_on::<ConfigMap>(Verb::Create).await;
        assert!(cluster.create("ns", &config_map("a", "s1")).await.is_err());
        assert!(cluster.list::<ConfigMap>("ns", "").await.is_ok());
        assert!(cluster.list::<Pod>("ns", "").await.is_ok());

        cluster.clear_failures().await;
        cluster.create("ns", &config_map("a", "s1")).await.unwrap();
    }

    #[tokio::test]
    async fn delete_collection_counts_matches() {
        let cluster = MemoryCluster::new();
        cluster.create("ns", &config_map("a", "s1")).await.unwrap();
        cluster.create("ns", &config_map("b", "s1")).await.unwrap();
        cluster.create("ns", &config_map("c", "s2")).await.unwrap();
        let removed = cluster
            .delete_collection::<ConfigMap>("ns", "faasgrid_service=s1")
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cluster.count::<ConfigMap>("ns").await, 1);
    }

    #[tokio::test]
    async fn node_selector_filters_control_plane() {
        let cluster = MemoryCluster::new();
        cluster
            .add_node("cp", &[("node-role.kubernetes.io/control-plane", "")])
            .await;
        cluster.add_node("w1", &[]).await;
        let workers = cluster
            .list_nodes("!node-role.kubernetes.io/control-plane")
            .await
            .unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(object_name(&workers[0]), "w1");
    }

    #[tokio::test]
    async fn openfaas_operator_creates_and_collects_deployment() {
        let cluster = MemoryCluster::new();
        cluster.enable_openfaas_operator().await;
        let function = Function::new(
            "f1",
            crate::crd::FunctionSpec {
                name: "f1".to_string(),
                image: "alpine".to_string(),
                ..Default::default()
            },
        );
        cluster.create("ns", &function).await.unwrap();
        let deployment: Deployment = cluster.get("ns", "f1").await.unwrap();
        assert_eq!(object_name(&deployment), "f1");

        cluster.delete::<Function>("ns", "f1").await.unwrap();
        assert!(!cluster.contains::<Deployment>("ns", "f1").await);
    }

    #[tokio::test]
    async fn watch_replays_existing_then_streams_matching() {
        let cluster = MemoryCluster::new();
        cluster
            .emit_pod(PodEvent::Applied(pod_in_phase("ns", "p0", &[("g", "1")], "Pending")))
            .await
            .unwrap();

        let mut events = cluster.watch_pods("ns", "g=1");
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(object_name(first.pod()), "p0");

        cluster
            .emit_pod(PodEvent::Applied(pod_in_phase("ns", "skip", &[("g", "2")], "Running")))
            .await
            .unwrap();
        cluster
            .emit_pod(PodEvent::Applied(pod_in_phase("ns", "p1", &[("g", "1")], "Running")))
            .await
            .unwrap();
        let next = events.next().await.unwrap().unwrap();
        assert_eq!(object_name(next.pod()), "p1");
    }

    #[tokio::test]
    async fn watch_failure_surfaces_as_error() {
        let cluster = MemoryCluster::new();
        cluster.fail_on::<Pod>(Verb::Watch).await;
        let mut events = cluster.watch_pods("ns", "");
        assert!(matches!(events.next().await, Some(Err(ClusterError::Watch(_)))));
    }
}
