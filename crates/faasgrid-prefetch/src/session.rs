//! Prefetch sessions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use faasgrid_cluster::{ClusterApi, PodEvent, object_name};
use faasgrid_core::ServiceDescriptor;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::DaemonSet;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemonset::{image_puller, pod_group_selector, random_suffix, worker_selector};
use crate::error::{PrefetchError, PrefetchResult};

/// What to prefetch, and on behalf of which service.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchRequest {
    pub service: String,
    pub image: String,
    pub image_pull_secrets: Vec<String>,
}

impl From<&ServiceDescriptor> for PrefetchRequest {
    fn from(service: &ServiceDescriptor) -> Self {
        Self {
            service: service.name.clone(),
            image: service.image.clone(),
            image_pull_secrets: service.image_pull_secrets.clone(),
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchReport {
    pub image: String,
    /// Eligible nodes the image is now present on.
    pub nodes: usize,
    pub elapsed: Duration,
}

/// Starts prefetch sessions in one namespace.
#[derive(Debug, Clone)]
pub struct ImagePrefetcher<C> {
    cluster: C,
    namespace: String,
    timeout: Duration,
}

impl<C: ClusterApi> ImagePrefetcher<C> {
    pub fn new(cluster: C, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            timeout,
        }
    }

    /// Count eligible nodes, submit the puller DaemonSet and start watching.
    ///
    /// With no eligible nodes the session is complete immediately and no
    /// DaemonSet is created.
    pub async fn start(&self, request: PrefetchRequest) -> PrefetchResult<PrefetchSession<C>> {
        let nodes = self
            .cluster
            .list_nodes(&worker_selector())
            .await
            .map_err(PrefetchError::Nodes)?;
        let target = nodes.len();

        let suffix = random_suffix();
        let pod_group = format!("pod-group-{suffix}");
        let mut session = PrefetchSession {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            image: request.image.clone(),
            pod_group,
            target,
            ready: Arc::new(Mutex::new(HashSet::new())),
            started: Instant::now(),
            daemonset: None,
            done: None,
            watch: None,
            cancel: CancellationToken::new(),
        };
        if target == 0 {
            info!(image = %request.image, "no eligible nodes, nothing to prefetch");
            return Ok(session);
        }

        // Subscribe before the DaemonSet exists so no pod event is missed.
        let events = self
            .cluster
            .watch_pods(&self.namespace, &pod_group_selector(&session.pod_group));

        let name = format!("image-puller-{}-{suffix}", request.service);
        let daemonset = image_puller(&name, &session.pod_group, &request);
        self.cluster
            .create(&self.namespace, &daemonset)
            .await
            .map_err(|source| PrefetchError::CreateDaemonSet {
                name: name.clone(),
                source,
            })?;
        session.daemonset = Some(name);

        let (done_tx, done_rx) = oneshot::channel();
        session.done = Some(done_rx);
        session.watch = Some(tokio::spawn(count_running(
            events,
            target,
            session.ready.clone(),
            done_tx,
            session.cancel.clone(),
        )));

        info!(
            image = %request.image,
            service = %request.service,
            pod_group = %session.pod_group,
            nodes = target,
            "prefetch session started"
        );
        Ok(session)
    }

    /// Run a session to completion, bounded by the configured timeout.
    pub async fn prefetch(&self, request: PrefetchRequest) -> PrefetchResult<PrefetchReport> {
        self.start(request).await?.wait(self.timeout).await
    }
}

/// Record distinct nodes with a `Running` puller until `target` is reached,
/// the stream ends, or `cancel` fires. Stream errors are logged and skipped.
async fn count_running(
    mut events: BoxStream<'static, faasgrid_cluster::ClusterResult<PodEvent>>,
    target: usize,
    ready: Arc<Mutex<HashSet<String>>>,
    done: oneshot::Sender<PrefetchResult<()>>,
    cancel: CancellationToken,
) {
    let outcome = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.next() => event,
        };
        match event {
            Some(Ok(PodEvent::Applied(pod))) => {
                let running = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running");
                if !running {
                    continue;
                }
                // A puller recreated on the same node must not count twice.
                let node = pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    .unwrap_or_else(|| object_name(&pod));
                let mut ready = ready.lock().await;
                if ready.insert(node.to_string()) {
                    debug!(pod = object_name(&pod), node, ready = ready.len(), target, "image ready on node");
                }
                if ready.len() >= target {
                    break Ok(());
                }
            }
            Some(Ok(PodEvent::Deleted(_))) => {}
            Some(Err(e)) => {
                warn!(error = %e, "pod watch error, waiting for the watch to resume");
            }
            None => break Err(PrefetchError::Watch("pod watch ended".to_string())),
        }
    };
    // The owner may have given up already.
    let _ = done.send(outcome);
}

/// One in-flight prefetch. Dropping it tears it down in the background.
pub struct PrefetchSession<C: ClusterApi> {
    cluster: C,
    namespace: String,
    image: String,
    pod_group: String,
    target: usize,
    ready: Arc<Mutex<HashSet<String>>>,
    started: Instant,
    daemonset: Option<String>,
    done: Option<oneshot::Receiver<PrefetchResult<()>>>,
    watch: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<C: ClusterApi> PrefetchSession<C> {
    pub fn pod_group(&self) -> &str {
        &self.pod_group
    }

    /// Number of eligible nodes.
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn daemonset_name(&self) -> Option<&str> {
        self.daemonset.as_deref()
    }

    /// Distinct nodes seen running the puller so far.
    pub async fn ready_count(&self) -> usize {
        self.ready.lock().await.len()
    }

    /// Token that abandons the session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until every eligible node runs the image, then tear down.
    ///
    /// The DaemonSet is deleted in every outcome. On timeout or
    /// cancellation the first error is returned even if teardown fails too.
    pub async fn wait(mut self, timeout: Duration) -> PrefetchResult<PrefetchReport> {
        let outcome = match self.done.take() {
            None => Ok(()),
            Some(done) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(PrefetchError::Cancelled(self.image.clone())),
                    result = tokio::time::timeout(timeout, done) => match result {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(PrefetchError::Watch("pod watch task stopped".to_string())),
                        Err(_) => Err(PrefetchError::Timeout {
                            image: self.image.clone(),
                            ready: self.ready_count().await,
                            target: self.target,
                            after: timeout,
                        }),
                    },
                }
            }
        };

        let teardown = self.teardown().await;
        match (&outcome, &teardown) {
            (Err(e), Err(t)) => warn!(error = %t, original = %e, "image puller teardown failed"),
            (Err(e), Ok(())) => warn!(image = %self.image, error = %e, "prefetch incomplete"),
            _ => {}
        }
        outcome?;
        teardown?;

        let report = PrefetchReport {
            image: self.image.clone(),
            nodes: self.target,
            elapsed: self.started.elapsed(),
        };
        info!(image = %report.image, nodes = report.nodes, elapsed = ?report.elapsed, "prefetch complete");
        Ok(report)
    }

    /// Stop the watch and delete the DaemonSet without waiting.
    pub async fn abandon(mut self) -> PrefetchResult<()> {
        self.teardown().await
    }

    async fn teardown(&mut self) -> PrefetchResult<()> {
        self.cancel.cancel();
        if let Some(watch) = self.watch.take() {
            watch.abort();
        }
        let Some(name) = self.daemonset.take() else {
            return Ok(());
        };
        match self.cluster.delete::<DaemonSet>(&self.namespace, &name).await {
            Ok(()) => {
                debug!(daemonset = %name, "image puller deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(source) => Err(PrefetchError::Teardown { name, source }),
        }
    }
}

impl<C: ClusterApi> Drop for PrefetchSession<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(watch) = self.watch.take() {
            watch.abort();
        }
        let Some(name) = self.daemonset.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(daemonset = %name, "no runtime to delete abandoned image puller");
            return;
        };
        let cluster = self.cluster.clone();
        let namespace = self.namespace.clone();
        runtime.spawn(async move {
            if let Err(e) = cluster.delete::<DaemonSet>(&namespace, &name).await {
                warn!(daemonset = %name, error = %e, "failed to delete abandoned image puller");
            }
        });
    }
}

impl<C: ClusterApi> std::fmt::Debug for PrefetchSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchSession")
            .field("image", &self.image)
            .field("pod_group", &self.pod_group)
            .field("target", &self.target)
            .field("daemonset", &self.daemonset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faasgrid_cluster::{MemoryCluster, Verb, pod_in_phase};
    use k8s_openapi::api::core::v1::{Pod, PodSpec};

    const NS: &str = "faasgrid-svc";

    fn request() -> PrefetchRequest {
        PrefetchRequest {
            service: "s1".to_string(),
            image: "alpine".to_string(),
            image_pull_secrets: Vec::new(),
        }
    }

    async fn cluster_with_workers(workers: usize) -> MemoryCluster {
        let cluster = MemoryCluster::new();
        cluster
            .add_node("cp", &[("node-role.kubernetes.io/control-plane", "")])
            .await;
        for i in 0..workers {
            cluster.add_node(&format!("w{i}"), &[]).await;
        }
        cluster
    }

    async fn run_pod(cluster: &MemoryCluster, session: &PrefetchSession<MemoryCluster>, name: &str) {
        let pod = pod_in_phase(NS, name, &[("pod-group", session.pod_group())], "Running");
        cluster.emit_pod(PodEvent::Applied(pod)).await.unwrap();
    }

    #[tokio::test]
    async fn completes_once_every_worker_runs_the_image() {
        let cluster = cluster_with_workers(3).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let session = prefetcher.start(request()).await.unwrap();
        assert_eq!(session.target(), 3);
        let ds = session.daemonset_name().unwrap().to_string();
        assert!(ds.starts_with("image-puller-s1-"));
        assert!(cluster.contains::<DaemonSet>(NS, &ds).await);

        for name in ["p0", "p1", "p2"] {
            run_pod(&cluster, &session, name).await;
        }
        let report = session.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.nodes, 3);
        assert!(!cluster.contains::<DaemonSet>(NS, &ds).await);
    }

    #[tokio::test(start_paused = true)]
    async fn fewer_running_pods_never_complete() {
        let cluster = cluster_with_workers(3).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let session = prefetcher.start(request()).await.unwrap();
        let ds = session.daemonset_name().unwrap().to_string();

        run_pod(&cluster, &session, "p0").await;
        run_pod(&cluster, &session, "p1").await;
        // Repeated events for the same pod count once.
        run_pod(&cluster, &session, "p1").await;
        let pending = pod_in_phase(NS, "p2", &[("pod-group", session.pod_group())], "Pending");
        cluster.emit_pod(PodEvent::Applied(pending)).await.unwrap();

        let err = session.wait(Duration::from_secs(30)).await.unwrap_err();
        assert!(
            matches!(err, PrefetchError::Timeout { ready: 2, target: 3, .. }),
            "{err:?}"
        );
        assert!(!cluster.contains::<DaemonSet>(NS, &ds).await);
    }

    #[tokio::test]
    async fn other_pod_groups_do_not_count() {
        let cluster = cluster_with_workers(1).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let session = prefetcher.start(request()).await.unwrap();

        let stranger = pod_in_phase(NS, "x", &[("pod-group", "pod-group-zzzzz")], "Running");
        cluster.emit_pod(PodEvent::Applied(stranger)).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(session.ready_count().await, 0);

        run_pod(&cluster, &session, "p0").await;
        session.wait(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn recreated_puller_on_the_same_node_counts_once() {
        let cluster = cluster_with_workers(2).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let session = prefetcher.start(request()).await.unwrap();

        for name in ["p0", "p0-replacement"] {
            let mut pod = pod_in_phase(NS, name, &[("pod-group", session.pod_group())], "Running");
            pod.spec = Some(PodSpec {
                node_name: Some("w0".to_string()),
                ..Default::default()
            });
            cluster.emit_pod(PodEvent::Applied(pod)).await.unwrap();
        }

        let err = session.wait(Duration::from_secs(30)).await.unwrap_err();
        assert!(
            matches!(err, PrefetchError::Timeout { ready: 1, target: 2, .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn watch_errors_do_not_end_the_session() {
        let cluster = cluster_with_workers(1).await;
        cluster.fail_on::<Pod>(Verb::Watch).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let session = prefetcher.start(request()).await.unwrap();

        run_pod(&cluster, &session, "p0").await;
        let report = session.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.nodes, 1);
    }

    #[tokio::test]
    async fn concurrent_sessions_count_only_their_own_pods() {
        let cluster = cluster_with_workers(2).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let first = prefetcher.start(request()).await.unwrap();
        let second = prefetcher
            .start(PrefetchRequest {
                service: "s2".to_string(),
                ..request()
            })
            .await
            .unwrap();
        assert_ne!(first.pod_group(), second.pod_group());
        let second_ds = second.daemonset_name().unwrap().to_string();

        run_pod(&cluster, &first, "a0").await;
        run_pod(&cluster, &second, "b0").await;
        run_pod(&cluster, &first, "a1").await;
        first.wait(Duration::from_secs(5)).await.unwrap();

        for _ in 0..10 {
            if second.ready_count().await == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(second.ready_count().await, 1);
        assert!(cluster.contains::<DaemonSet>(NS, &second_ds).await);

        run_pod(&cluster, &second, "b1").await;
        let report = second.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.nodes, 2);
        assert!(!cluster.contains::<DaemonSet>(NS, &second_ds).await);
    }

    #[tokio::test]
    async fn no_eligible_nodes_completes_without_daemonset() {
        let cluster = cluster_with_workers(0).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let report = prefetcher.prefetch(request()).await.unwrap();
        assert_eq!(report.nodes, 0);
        assert_eq!(cluster.count::<DaemonSet>(NS).await, 0);
    }

    #[tokio::test]
    async fn daemonset_creation_failure_is_returned() {
        let cluster = cluster_with_workers(2).await;
        cluster.fail_on::<DaemonSet>(Verb::Create).await;
        let prefetcher = ImagePrefetcher::new(cluster, NS, Duration::from_secs(5));
        let err = prefetcher.start(request()).await.unwrap_err();
        assert!(matches!(err, PrefetchError::CreateDaemonSet { .. }));
    }

    #[tokio::test]
    async fn cancellation_tears_down() {
        let cluster = cluster_with_workers(2).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let session = prefetcher.start(request()).await.unwrap();
        let ds = session.daemonset_name().unwrap().to_string();

        session.cancellation_token().cancel();
        let err = session.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, PrefetchError::Cancelled(_)));
        assert!(!cluster.contains::<DaemonSet>(NS, &ds).await);
    }

    #[tokio::test]
    async fn dropped_session_deletes_daemonset() {
        let cluster = cluster_with_workers(1).await;
        let prefetcher = ImagePrefetcher::new(cluster.clone(), NS, Duration::from_secs(5));
        let session = prefetcher.start(request()).await.unwrap();
        let ds = session.daemonset_name().unwrap().to_string();

        drop(session);
        for _ in 0..10 {
            if !cluster.contains::<DaemonSet>(NS, &ds).await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("abandoned DaemonSet was not deleted");
    }
}
