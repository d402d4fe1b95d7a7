//! OpenFaaS driver.
//!
//! Services are submitted as `openfaas.com/v1` Functions. The OpenFaaS
//! operator reconciles each Function into a Deployment of the same name;
//! the driver waits for that Deployment and swaps its pod template for the
//! compiled one, so the function runs under the faasgrid supervisor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faasgrid_cluster::{ClusterApi, Function, FunctionSpec, object_name};
use faasgrid_compiler::compile;
use faasgrid_core::constants::{SERVICE_LABEL, openfaas};
use faasgrid_core::{GlobalConfig, ServiceDescriptor};
use faasgrid_state::MetadataStore;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PodSpec;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::backend::{
    BackendInfo, ServerlessBackend, collect_records, delete_jobs, service_labels, validate,
};
use crate::error::{BackendError, BackendResult};
use crate::saga::{Saga, best_effort};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct OpenFaasBackend<C> {
    cluster: C,
    store: MetadataStore<C>,
    config: Arc<GlobalConfig>,
    namespace: String,
    gateway: String,
}

impl<C: ClusterApi> OpenFaasBackend<C> {
    pub fn new(cluster: C, config: Arc<GlobalConfig>) -> Self {
        let namespace = config.services_namespace.clone();
        Self {
            store: MetadataStore::new(cluster.clone(), namespace.clone()),
            gateway: config.openfaas_gateway(),
            cluster,
            config,
            namespace,
        }
    }

    /// Gateway endpoint that invokes functions (`host:port`).
    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    /// Poll until the operator has created the function's Deployment.
    async fn wait_for_deployment(&self, name: &str) -> BackendResult<Deployment> {
        let timeout = self.config.openfaas_deployment_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            match self.cluster.get::<Deployment>(&self.namespace, name).await {
                Ok(deployment) => return Ok(deployment),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(BackendError::BackendUnavailable(format!(
                    "the OpenFaaS operator did not create a deployment for {name:?} within {timeout:?}"
                )));
            }
            debug!(service = %name, "waiting for the operator deployment");
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn replace_pod_spec(&self, mut deployment: Deployment, spec: PodSpec) -> BackendResult<()> {
        let name = object_name(&deployment).to_string();
        let template = &mut deployment
            .spec
            .get_or_insert_with(Default::default)
            .template;
        template.spec = Some(spec);
        self.cluster.replace(&self.namespace, &deployment).await?;
        debug!(service = %name, "operator deployment patched");
        Ok(())
    }
}

pub fn function(service: &ServiceDescriptor) -> Function {
    let mut labels = service_labels(service);
    labels.insert(openfaas::ZERO_SCALE_LABEL.to_string(), "true".to_string());
    let mut function = Function::new(
        &service.name,
        FunctionSpec {
            name: service.name.clone(),
            image: service.image.clone(),
            labels: labels.clone(),
            annotations: service.annotations.clone(),
            ..Default::default()
        },
    );
    function.metadata.labels = Some(labels);
    function
}

#[async_trait]
impl<C: ClusterApi> ServerlessBackend for OpenFaasBackend<C> {
    type Cluster = C;

    async fn get_info(&self) -> BackendResult<BackendInfo> {
        let version = self.cluster.server_version().await?;
        Ok(BackendInfo::new("OpenFaaS", version.git_version))
    }

    async fn list_services(&self) -> BackendResult<Vec<ServiceDescriptor>> {
        let functions: Vec<Function> = self.cluster.list(&self.namespace, SERVICE_LABEL).await?;
        let names: Vec<String> = functions.iter().map(|f| object_name(f).to_string()).collect();
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

        saga.step(self.cluster.create(&self.namespace, &function(service)))
            .await?;
        let cluster = self.cluster.clone();
        let namespace = self.namespace.clone();
        let name = service.name.clone();
        saga.compensate("delete function", async move {
            cluster.delete::<Function>(&namespace, &name).await
        });

        let deployment = saga.step(self.wait_for_deployment(&service.name)).await?;
        saga.step(self.replace_pod_spec(deployment, spec)).await?;
        saga.commit();
        info!(service = %service.name, namespace = %self.namespace, "openfaas function created");
        Ok(())
    }

    async fn read_service(&self, name: &str) -> BackendResult<ServiceDescriptor> {
        self.cluster.get::<Function>(&self.namespace, name).await?;
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

        let deployment: Deployment = saga
            .step(self.cluster.get(&self.namespace, &service.name))
            .await?;
        saga.step(self.replace_pod_spec(deployment, spec)).await?;
        saga.commit();
        info!(service = %service.name, "openfaas function updated");
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> BackendResult<()> {
        self.cluster.delete::<Function>(&self.namespace, name).await?;
        best_effort("delete metadata record", name, self.store.delete(name)).await;
        best_effort("delete jobs", name, delete_jobs(&self.cluster, &self.namespace, name)).await;
        info!(service = %name, "openfaas function deleted");
        Ok(())
    }

    fn cluster_client(&self) -> &C {
        &self.cluster
    }
}
