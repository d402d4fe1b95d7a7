//! Knative Serving driver.
//!
//! Each service becomes a cluster-local `serving.knative.dev/v1` Service
//! whose revision template is the compiled pod spec. Knative scales the
//! revision between the descriptor's synchronous bounds.

use std::sync::Arc;

use async_trait::async_trait;
use faasgrid_cluster::{
    ClusterApi, KnativeService, KnativeServiceSpec, RevisionSpec, RevisionTemplateSpec,
    object_name,
};
use faasgrid_compiler::compile;
use faasgrid_core::constants::{SERVICE_LABEL, knative};
use faasgrid_core::{GlobalConfig, ServiceDescriptor};
use faasgrid_state::MetadataStore;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;

use crate::backend::{
    BackendInfo, ServerlessBackend, SyncBackend, collect_records, delete_jobs, service_labels,
    validate,
};
use crate::error::BackendResult;
use crate::proxy::ProxyDirector;
use crate::saga::{Saga, best_effort};

#[derive(Debug, Clone)]
pub struct KnativeBackend<C> {
    cluster: C,
    store: MetadataStore<C>,
    config: Arc<GlobalConfig>,
    namespace: String,
}

impl<C: ClusterApi> KnativeBackend<C> {
    pub fn new(cluster: C, config: Arc<GlobalConfig>) -> Self {
        let namespace = config.services_namespace.clone();
        Self {
            store: MetadataStore::new(cluster.clone(), namespace.clone()),
            cluster,
            config,
            namespace,
        }
    }
}

fn revision_template(service: &ServiceDescriptor, mut spec: PodSpec) -> RevisionTemplateSpec {
    // Knative owns restarts.
    spec.restart_policy = None;
    let mut annotations = service.annotations.clone();
    annotations.insert(
        knative::MIN_SCALE_ANNOTATION.to_string(),
        service.synchronous.min_scale.to_string(),
    );
    if service.synchronous.max_scale > 0 {
        annotations.insert(
            knative::MAX_SCALE_ANNOTATION.to_string(),
            service.synchronous.max_scale.to_string(),
        );
    }
    RevisionTemplateSpec {
        metadata: ObjectMeta {
            labels: Some(service_labels(service)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: RevisionSpec {
            pod: spec,
            ..Default::default()
        },
    }
}

/// The Knative Service for `service`, without a resource version.
pub fn knative_service(service: &ServiceDescriptor, spec: PodSpec) -> KnativeService {
    let mut labels = service_labels(service);
    labels.insert(
        knative::VISIBILITY_LABEL.to_string(),
        knative::CLUSTER_LOCAL.to_string(),
    );
    let mut ksvc = KnativeService::new(
        &service.name,
        KnativeServiceSpec {
            template: revision_template(service, spec),
        },
    );
    ksvc.metadata.labels = Some(labels);
    ksvc.metadata.annotations =
        (!service.annotations.is_empty()).then(|| service.annotations.clone());
    ksvc
}

impl<C: ClusterApi> SyncBackend for KnativeBackend<C> {
    fn proxy_director(&self, service: &str) -> ProxyDirector {
        ProxyDirector::http(format!("{service}.{}", self.namespace))
    }
}

#[async_trait]
impl<C: ClusterApi> ServerlessBackend for KnativeBackend<C> {
    type Cluster = C;

    async fn get_info(&self) -> BackendResult<BackendInfo> {
        let version = self.cluster.server_version().await?;
        Ok(BackendInfo::new("Knative", version.git_version))
    }

    async fn list_services(&self) -> BackendResult<Vec<ServiceDescriptor>> {
        let services: Vec<KnativeService> =
            self.cluster.list(&self.namespace, SERVICE_LABEL).await?;
        let names: Vec<String> = services.iter().map(|s| object_name(s).to_string()).collect();
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
                .create(&self.namespace, &knative_service(service, spec)),
        )
        .await?;
        saga.commit();
        info!(service = %service.name, namespace = %self.namespace, "knative service created");
        Ok(())
    }

    async fn read_service(&self, name: &str) -> BackendResult<ServiceDescriptor> {
        self.cluster
            .get::<KnativeService>(&self.namespace, name)
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

        let mut current: KnativeService = saga
            .step(self.cluster.get(&self.namespace, &service.name))
            .await?;
        let desired = knative_service(service, spec);
        current.spec = desired.spec;
        // Keys set by the Knative server (creator, lastModifier) must survive.
        if let Some(labels) = desired.metadata.labels {
            current.metadata.labels.get_or_insert_with(Default::default).extend(labels);
        }
        if let Some(annotations) = desired.metadata.annotations {
            current
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .extend(annotations);
        }
        saga.step(self.cluster.replace(&self.namespace, &current))
            .await?;
        saga.commit();
        info!(service = %service.name, "knative service updated");
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> BackendResult<()> {
        self.cluster
            .delete::<KnativeService>(&self.namespace, name)
            .await?;
        best_effort("delete metadata record", name, self.store.delete(name)).await;
        best_effort("delete jobs", name, delete_jobs(&self.cluster, &self.namespace, name)).await;
        info!(service = %name, "knative service deleted");
        Ok(())
    }

    fn cluster_client(&self) -> &C {
        &self.cluster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faasgrid_core::SynchronousSettings;

    #[test]
    fn services_are_cluster_local_and_bounded() {
        let service = ServiceDescriptor {
            name: "s1".to_string(),
            image: "alpine".to_string(),
            synchronous: SynchronousSettings {
                min_scale: 1,
                max_scale: 4,
            },
            ..Default::default()
        };
        let spec = compile(&service, &GlobalConfig::default()).unwrap();
        let ksvc = knative_service(&service, spec);

        let labels = ksvc.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[knative::VISIBILITY_LABEL], "cluster-local");
        assert_eq!(labels[SERVICE_LABEL], "s1");

        let template = &ksvc.spec.template;
        let annotations = template.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[knative::MIN_SCALE_ANNOTATION], "1");
        assert_eq!(annotations[knative::MAX_SCALE_ANNOTATION], "4");
        assert!(template.spec.pod.restart_policy.is_none());
        assert_eq!(template.spec.pod.containers[0].image.as_deref(), Some("alpine"));
    }

    #[test]
    fn unbounded_max_scale_is_omitted() {
        let service = ServiceDescriptor {
            name: "s1".to_string(),
            image: "alpine".to_string(),
            ..Default::default()
        };
        let ksvc = knative_service(&service, PodSpec::default());
        let annotations = ksvc.spec.template.metadata.annotations.unwrap();
        assert_eq!(annotations[knative::MIN_SCALE_ANNOTATION], "0");
        assert!(!annotations.contains_key(knative::MAX_SCALE_ANNOTATION));
    }
}
