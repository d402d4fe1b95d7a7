//! Native Kubernetes driver.
//!
//! A service is stored as a PodTemplate named after it; asynchronous
//! invocations spawn Jobs from that template. Services with an API port
//! also get a long-running exposure (see [`crate::expose`]), and services
//! asking for it get their image prefetched onto every worker node.

use std::sync::Arc;

use async_trait::async_trait;
use faasgrid_cluster::{ClusterApi, object_name};
use faasgrid_compiler::compile;
use faasgrid_core::constants::SERVICE_LABEL;
use faasgrid_core::{GlobalConfig, ServiceDescriptor};
use faasgrid_prefetch::{ImagePrefetcher, PrefetchRequest};
use faasgrid_state::MetadataStore;
use k8s_openapi::api::core::v1::{PodSpec, PodTemplate, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{info, warn};

use crate::backend::{
    BackendInfo, ServerlessBackend, SyncBackend, collect_records, delete_jobs, service_labels,
    validate,
};
use crate::error::{BackendError, BackendResult};
use crate::expose;
use crate::proxy::ProxyDirector;
use crate::saga::{Saga, best_effort};

#[derive(Debug, Clone)]
pub struct KubernetesBackend<C> {
    cluster: C,
    store: MetadataStore<C>,
    prefetcher: ImagePrefetcher<C>,
    config: Arc<GlobalConfig>,
    namespace: String,
}

impl<C: ClusterApi> KubernetesBackend<C> {
    pub fn new(cluster: C, config: Arc<GlobalConfig>) -> Self {
        let namespace = config.services_namespace.clone();
        Self {
            store: MetadataStore::new(cluster.clone(), namespace.clone()),
            prefetcher: ImagePrefetcher::new(
                cluster.clone(),
                namespace.clone(),
                config.prefetch_timeout(),
            ),
            cluster,
            config,
            namespace,
        }
    }

    fn pod_template(&self, service: &ServiceDescriptor, spec: PodSpec) -> PodTemplate {
        let labels = service_labels(service);
        let annotations = (!service.annotations.is_empty()).then(|| service.annotations.clone());
        PodTemplate {
            metadata: ObjectMeta {
                name: Some(service.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: annotations.clone(),
                ..Default::default()
            },
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations,
                    ..Default::default()
                }),
                spec: Some(spec),
            }),
        }
    }

    /// Prefetch after the service committed; a failure no longer undoes it.
    async fn prefetch(&self, operation: &'static str, service: &ServiceDescriptor) -> BackendResult<()> {
        if !service.image_prefetch {
            return Ok(());
        }
        match self.prefetcher.prefetch(PrefetchRequest::from(service)).await {
            Ok(report) => {
                info!(
                    service = %service.name,
                    image = %report.image,
                    nodes = report.nodes,
                    elapsed = ?report.elapsed,
                    "image prefetched"
                );
                Ok(())
            }
            Err(e) => {
                warn!(service = %service.name, error = %e, "image prefetch failed");
                Err(BackendError::partial(operation, &service.name, e.into()))
            }
        }
    }
}

impl<C: ClusterApi> SyncBackend for KubernetesBackend<C> {
    /// Synchronous requests go through the exposed ClusterIP Service.
    fn proxy_director(&self, service: &str) -> ProxyDirector {
        ProxyDirector::http(format!("{}.{}", expose::service_name(service), self.namespace))
    }
}

#[async_trait]
impl<C: ClusterApi> ServerlessBackend for KubernetesBackend<C> {
    type Cluster = C;

    async fn get_info(&self) -> BackendResult<BackendInfo> {
        // The cluster version is reported by the cluster status endpoint.
        Ok(BackendInfo::new("Kubernetes", "unset"))
    }

    async fn list_services(&self) -> BackendResult<Vec<ServiceDescriptor>> {
        let templates: Vec<PodTemplate> = self.cluster.list(&self.namespace, SERVICE_LABEL).await?;
        let names: Vec<String> = templates.iter().map(|t| object_name(t).to_string()).collect();
        Ok(collect_records(&self.store, names).await)
    }

    async fn create_service(&self, service: &ServiceDescriptor) -> BackendResult<()> {
        validate(service, &self.config)?;
        let spec = compile(service, &self.config)?;

        let mut saga = Saga::new("create", &service.name);
        saga.step(self.store.create(service)).await?;
        let store = self.store.clone();
        let name = service.name.clone();
        saga.compensate("delete metadata record", async move { store.delete(&name).await });

        saga.step(
            self.cluster
                .create(&self.namespace, &self.pod_template(service, spec.clone())),
        )
        .await?;
        let cluster = self.cluster.clone();
        let namespace = self.namespace.clone();
        let name = service.name.clone();
        saga.compensate("delete pod template", async move {
            cluster.delete::<PodTemplate>(&namespace, &name).await
        });

        if service.is_exposed() {
            expose::create(&self.cluster, &self.namespace, service, &spec, &mut saga).await?;
        }
        saga.commit();
        info!(service = %service.name, namespace = %self.namespace, "service created");

        self.prefetch("create", service).await
    }

    async fn read_service(&self, name: &str) -> BackendResult<ServiceDescriptor> {
        self.cluster
            .get::<PodTemplate>(&self.namespace, name)
            .await?;
        Ok(self.store.get(name).await?.into_descriptor())
    }

    async fn update_service(&self, service: &ServiceDescriptor) -> BackendResult<()> {
        validate(service, &self.config)?;
        let spec = compile(service, &self.config)?;
        let previous = self.store.get_raw(&service.name).await?;

        let mut saga = Saga::new("update", &service.name);
        saga.step(self.store.replace(service)).await?;
        let store = self.store.clone();
        saga.compensate("restore metadata record", async move { store.restore(&previous).await });

        let current: PodTemplate = saga
            .step(self.cluster.get(&self.namespace, &service.name))
            .await?;
        let mut updated = self.pod_template(service, spec.clone());
        updated.metadata.resource_version = current.metadata.resource_version;
        saga.step(self.cluster.replace(&self.namespace, &updated))
            .await?;
        saga.step(expose::update(&self.cluster, &self.namespace, service, &spec))
            .await?;
        saga.commit();
        info!(service = %service.name, "service updated");

        self.prefetch("update", service).await
    }

    async fn delete_service(&self, name: &str) -> BackendResult<()> {
        self.cluster
            .delete::<PodTemplate>(&self.namespace, name)
            .await?;
        best_effort("delete metadata record", name, self.store.delete(name)).await;
        best_effort("delete jobs", name, delete_jobs(&self.cluster, &self.namespace, name)).await;
        best_effort(
            "delete exposure",
            name,
            expose::delete(&self.cluster, &self.namespace, name),
        )
        .await;
        info!(service = %name, "service deleted");
        Ok(())
    }

    fn cluster_client(&self) -> &C {
        &self.cluster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faasgrid_cluster::MemoryCluster;

    #[test]
    fn pod_template_carries_labels_and_annotations() {
        let backend = KubernetesBackend::new(MemoryCluster::new(), Arc::new(GlobalConfig::default()));
        let service = ServiceDescriptor {
            name: "s1".to_string(),
            image: "alpine".to_string(),
            annotations: [("owner".to_string(), "team-a".to_string())].into(),
            ..Default::default()
        };
        let template = backend.pod_template(&service, PodSpec::default());
        assert_eq!(template.metadata.name.as_deref(), Some("s1"));
        assert_eq!(template.metadata.namespace.as_deref(), Some("faasgrid-svc"));
        let inner = template.template.unwrap().metadata.unwrap();
        assert_eq!(inner.labels.unwrap()[SERVICE_LABEL], "s1");
        assert_eq!(inner.annotations.unwrap()["owner"], "team-a");
    }

    #[test]
    fn director_targets_the_exposed_service() {
        let backend = KubernetesBackend::new(MemoryCluster::new(), Arc::new(GlobalConfig::default()));
        let director = backend.proxy_director("s1");
        assert_eq!(director.authority(), "s1-svc.faasgrid-svc");
        assert_eq!(director.path(), "/");
    }
}
