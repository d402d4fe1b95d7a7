//! The backend contract and the startup dispatcher.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use faasgrid_cluster::ClusterApi;
use faasgrid_core::constants::SERVICE_LABEL;
use faasgrid_core::{GlobalConfig, ServiceDescriptor};
use faasgrid_state::MetadataStore;
use k8s_openapi::api::batch::v1::Job;
use tracing::{debug, warn};

use crate::error::{BackendError, BackendResult};
use crate::fake::FakeBackend;
use crate::knative::KnativeBackend;
use crate::kubernetes::KubernetesBackend;
use crate::openfaas::OpenFaasBackend;
use crate::proxy::ProxyDirector;

/// Backend identity as reported by [`ServerlessBackend::get_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub name: String,
    pub version: String,
}

impl BackendInfo {
    pub fn new(name: &str, version: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            version: version.into(),
        }
    }
}

/// Lifecycle operations every driver supports.
///
/// Operations on different services are independent. Callers serialize
/// concurrent writes to the same service name themselves.
#[async_trait]
pub trait ServerlessBackend: Send + Sync {
    type Cluster: ClusterApi;

    async fn get_info(&self) -> BackendResult<BackendInfo>;

    /// Every service with a backend-native resource and a decodable
    /// Metadata Record. Entries without one are skipped with a warning.
    async fn list_services(&self) -> BackendResult<Vec<ServiceDescriptor>>;

    async fn create_service(&self, service: &ServiceDescriptor) -> BackendResult<()>;

    async fn read_service(&self, name: &str) -> BackendResult<ServiceDescriptor>;

    async fn update_service(&self, service: &ServiceDescriptor) -> BackendResult<()>;

    /// Remove the backend-native resource. Metadata and job cleanup is best
    /// effort and never fails the call.
    async fn delete_service(&self, name: &str) -> BackendResult<()>;

    /// The underlying cluster handle, for collaborators that query pods and
    /// logs directly.
    fn cluster_client(&self) -> &Self::Cluster;
}

/// Backends able to route synchronous HTTP invocations.
pub trait SyncBackend: ServerlessBackend {
    fn proxy_director(&self, service: &str) -> ProxyDirector;
}

/// The closed set of drivers, chosen by `serverless_backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Kubernetes,
    Knative,
    OpenFaas,
    Fake,
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "kubernetes" | "k8s" => Ok(BackendKind::Kubernetes),
            "knative" => Ok(BackendKind::Knative),
            "openfaas" => Ok(BackendKind::OpenFaas),
            "fake" => Ok(BackendKind::Fake),
            other => Err(BackendError::invalid(
                "serverless_backend",
                format!("unknown backend {other:?}"),
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Kubernetes => "kubernetes",
            BackendKind::Knative => "knative",
            BackendKind::OpenFaas => "openfaas",
            BackendKind::Fake => "fake",
        })
    }
}

/// A driver selected once at startup. Downstream code only sees
/// [`ServerlessBackend`].
#[derive(Debug)]
pub enum Backend<C: ClusterApi> {
    Kubernetes(KubernetesBackend<C>),
    Knative(KnativeBackend<C>),
    OpenFaas(OpenFaasBackend<C>),
    Fake(FakeBackend<C>),
}

impl<C: ClusterApi> Backend<C> {
    pub fn new(kind: BackendKind, cluster: C, config: Arc<GlobalConfig>) -> Self {
        match kind {
            BackendKind::Kubernetes => Backend::Kubernetes(KubernetesBackend::new(cluster, config)),
            BackendKind::Knative => Backend::Knative(KnativeBackend::new(cluster, config)),
            BackendKind::OpenFaas => Backend::OpenFaas(OpenFaasBackend::new(cluster, config)),
            BackendKind::Fake => Backend::Fake(FakeBackend::new(cluster)),
        }
    }

    pub fn from_config(cluster: C, config: Arc<GlobalConfig>) -> BackendResult<Self> {
        let kind: BackendKind = config.serverless_backend.parse()?;
        debug!(backend = %kind, namespace = %config.services_namespace, "backend selected");
        Ok(Self::new(kind, cluster, config))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Kubernetes(_) => BackendKind::Kubernetes,
            Backend::Knative(_) => BackendKind::Knative,
            Backend::OpenFaas(_) => BackendKind::OpenFaas,
            Backend::Fake(_) => BackendKind::Fake,
        }
    }

    /// Request rewriter for `service`, if this backend serves synchronous
    /// invocations.
    pub fn proxy_director(&self, service: &str) -> Option<ProxyDirector> {
        match self {
            Backend::Kubernetes(b) => Some(b.proxy_director(service)),
            Backend::Knative(b) => Some(b.proxy_director(service)),
            Backend::OpenFaas(_) | Backend::Fake(_) => None,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            Backend::Kubernetes($b) => $call,
            Backend::Knative($b) => $call,
            Backend::OpenFaas($b) => $call,
            Backend::Fake($b) => $call,
        }
    };
}

#[async_trait]
impl<C: ClusterApi> ServerlessBackend for Backend<C> {
    type Cluster = C;

    async fn get_info(&self) -> BackendResult<BackendInfo> {
        dispatch!(self, b => b.get_info().await)
    }

    async fn list_services(&self) -> BackendResult<Vec<ServiceDescriptor>> {
        dispatch!(self, b => b.list_services().await)
    }

    async fn create_service(&self, service: &ServiceDescriptor) -> BackendResult<()> {
        dispatch!(self, b => b.create_service(service).await)
    }

    async fn read_service(&self, name: &str) -> BackendResult<ServiceDescriptor> {
        dispatch!(self, b => b.read_service(name).await)
    }

    async fn update_service(&self, service: &ServiceDescriptor) -> BackendResult<()> {
        dispatch!(self, b => b.update_service(service).await)
    }

    async fn delete_service(&self, name: &str) -> BackendResult<()> {
        dispatch!(self, b => b.delete_service(name).await)
    }

    fn cluster_client(&self) -> &C {
        dispatch!(self, b => b.cluster_client())
    }
}

/// Checks shared by every driver, run before any cluster call.
pub(crate) fn validate(service: &ServiceDescriptor, config: &GlobalConfig) -> BackendResult<()> {
    service
        .validate_name()
        .map_err(|e| BackendError::invalid("name", e))?;
    if !config.is_image_allowed(&service.image) {
        return Err(BackendError::invalid(
            "image",
            format!("{:?} matches no allowed image prefix", service.image),
        ));
    }
    Ok(())
}

/// User labels plus the service label.
pub(crate) fn service_labels(service: &ServiceDescriptor) -> BTreeMap<String, String> {
    let mut labels = service.labels.clone();
    labels.insert(SERVICE_LABEL.to_string(), service.name.clone());
    labels
}

pub(crate) fn service_selector(name: &str) -> String {
    format!("{SERVICE_LABEL}={name}")
}

/// Decode the Metadata Record of each name, skipping the ones that are
/// missing or unreadable.
pub(crate) async fn collect_records<C: ClusterApi>(
    store: &MetadataStore<C>,
    names: Vec<String>,
) -> Vec<ServiceDescriptor> {
    let mut services = Vec::new();
    for name in names {
        match store.get(&name).await {
            Ok(record) => services.push(record.into_descriptor()),
            Err(e) => warn!(service = %name, error = %e, "skipping service without usable metadata"),
        }
    }
    services
}

/// Remove Jobs left behind by asynchronous invocations of `name`.
pub(crate) async fn delete_jobs<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    name: &str,
) -> BackendResult<usize> {
    let removed = cluster
        .delete_collection::<Job>(namespace, &service_selector(name))
        .await?;
    if removed > 0 {
        debug!(service = %name, jobs = removed, "deleted service jobs");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faasgrid_cluster::MemoryCluster;

    #[test]
    fn kind_parsing() {
        assert_eq!("".parse::<BackendKind>().unwrap(), BackendKind::Kubernetes);
        assert_eq!("Knative".parse::<BackendKind>().unwrap(), BackendKind::Knative);
        assert_eq!("openfaas".parse::<BackendKind>().unwrap(), BackendKind::OpenFaas);
        assert_eq!("fake".parse::<BackendKind>().unwrap(), BackendKind::Fake);
        let err = "lambda".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, BackendError::InvalidResource { ref field, .. } if field == "serverless_backend"));
    }

    #[test]
    fn dispatcher_follows_config() {
        let mut config = GlobalConfig::default();
        config.serverless_backend = "knative".to_string();
        let backend = Backend::from_config(MemoryCluster::new(), Arc::new(config)).unwrap();
        assert_eq!(backend.kind(), BackendKind::Knative);
        assert!(backend.proxy_director("s1").is_some());

        let backend = Backend::new(
            BackendKind::OpenFaas,
            MemoryCluster::new(),
            Arc::new(GlobalConfig::default()),
        );
        assert!(backend.proxy_director("s1").is_none());
    }

    #[test]
    fn validation_runs_before_the_cluster() {
        let mut config = GlobalConfig::default();
        config.allowed_image_prefixes = vec!["ghcr.io/grycap/".to_string()];

        let mut service = ServiceDescriptor {
            name: "Bad_Name".to_string(),
            image: "ghcr.io/grycap/cowsay".to_string(),
            ..Default::default()
        };
        let err = validate(&service, &config).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResource { ref field, .. } if field == "name"));

        service.name = "cowsay".to_string();
        assert!(validate(&service, &config).is_ok());

        service.image = "docker.io/library/alpine".to_string();
        let err = validate(&service, &config).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResource { ref field, .. } if field == "image"));
    }

    #[test]
    fn labels_always_carry_the_service() {
        let service = ServiceDescriptor {
            name: "s1".to_string(),
            labels: BTreeMap::from([("team".to_string(), "a".to_string())]),
            ..Default::default()
        };
        let labels = service_labels(&service);
        assert_eq!(labels[SERVICE_LABEL], "s1");
        assert_eq!(labels["team"], "a");
        assert_eq!(service_selector("s1"), "faasgrid_service=s1");
    }
}
