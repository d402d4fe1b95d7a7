//! MetadataStore: Metadata Record persistence over the cluster API.

use faasgrid_cluster::ClusterApi;
use faasgrid_core::ServiceDescriptor;
use faasgrid_core::constants::SERVICE_LABEL;
use k8s_openapi::api::core::v1::ConfigMap;
use tracing::debug;

use crate::error::StateResult;
use crate::record::MetadataRecord;

/// Typed CRUD over Metadata Records in one namespace.
#[derive(Debug, Clone)]
pub struct MetadataStore<C> {
    cluster: C,
    namespace: String,
}

impl<C: ClusterApi> MetadataStore<C> {
    pub fn new(cluster: C, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Persist a new record. Fails if one already exists for the name.
    pub async fn create(&self, service: &ServiceDescriptor) -> StateResult<()> {
        let cm = MetadataRecord::from_descriptor(service).to_config_map(&self.namespace)?;
        self.cluster.create(&self.namespace, &cm).await?;
        debug!(service = %service.name, namespace = %self.namespace, "metadata record created");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> StateResult<MetadataRecord> {
        let cm = self.get_raw(name).await?;
        MetadataRecord::from_config_map(&cm)
    }

    /// The stored ConfigMap as-is, for later [`restore`](Self::restore).
    pub async fn get_raw(&self, name: &str) -> StateResult<ConfigMap> {
        Ok(self.cluster.get::<ConfigMap>(&self.namespace, name).await?)
    }

    /// Overwrite an existing record with `service`.
    pub async fn replace(&self, service: &ServiceDescriptor) -> StateResult<()> {
        let current = self.get_raw(&service.name).await?;
        let mut updated = MetadataRecord::from_descriptor(service).to_config_map(&self.namespace)?;
        updated.metadata.resource_version = current.metadata.resource_version;
        self.cluster.replace(&self.namespace, &updated).await?;
        debug!(service = %service.name, "metadata record replaced");
        Ok(())
    }

    /// Write `previous` back unconditionally, recreating it if it is gone.
    pub async fn restore(&self, previous: &ConfigMap) -> StateResult<()> {
        let mut restored = previous.clone();
        restored.metadata.resource_version = None;
        restored.metadata.uid = None;
        match self.cluster.replace(&self.namespace, &restored).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                self.cluster.create(&self.namespace, &restored).await?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(service = ?previous.metadata.name, "metadata record restored");
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> StateResult<()> {
        self.cluster.delete::<ConfigMap>(&self.namespace, name).await?;
        debug!(service = %name, "metadata record deleted");
        Ok(())
    }

    /// Every record in the namespace, each decoded independently.
    pub async fn list(&self) -> StateResult<Vec<StateResult<MetadataRecord>>> {
        let maps: Vec<ConfigMap> = self.cluster.list(&self.namespace, SERVICE_LABEL).await?;
        Ok(maps.iter().map(MetadataRecord::from_config_map).collect())
    }
}
