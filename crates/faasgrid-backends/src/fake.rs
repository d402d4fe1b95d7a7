//! In-memory backend for routing-layer tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use faasgrid_cluster::ClusterApi;
use faasgrid_core::ServiceDescriptor;
use tokio::sync::Mutex;

use crate::backend::{BackendInfo, ServerlessBackend};
use crate::error::{BackendError, BackendResult};

/// Operation a [`FakeBackend`] failure can be switched on for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOperation {
    GetInfo,
    ListServices,
    CreateService,
    ReadService,
    UpdateService,
    DeleteService,
}

#[derive(Debug, Default)]
struct State {
    services: BTreeMap<String, ServiceDescriptor>,
    failing: HashSet<FakeOperation>,
}

/// Keeps services in a map; touches the cluster handle only to hand it out.
#[derive(Debug, Clone)]
pub struct FakeBackend<C> {
    cluster: C,
    state: Arc<Mutex<State>>,
}

impl<C: ClusterApi> FakeBackend<C> {
    pub fn new(cluster: C) -> Self {
        Self {
            cluster,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Make `operation` fail with [`BackendError::BackendUnavailable`].
    pub async fn fail_on(&self, operation: FakeOperation) {
        self.state.lock().await.failing.insert(operation);
    }

    pub async fn recover(&self, operation: FakeOperation) {
        self.state.lock().await.failing.remove(&operation);
    }

    async fn check(&self, operation: FakeOperation) -> BackendResult<()> {
        if self.state.lock().await.failing.contains(&operation) {
            return Err(BackendError::BackendUnavailable(format!(
                "fake failure in {operation:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<C: ClusterApi> ServerlessBackend for FakeBackend<C> {
    type Cluster = C;

    async fn get_info(&self) -> BackendResult<BackendInfo> {
        self.check(FakeOperation::GetInfo).await?;
        Ok(BackendInfo::new("fake-backend", "devel"))
    }

    async fn list_services(&self) -> BackendResult<Vec<ServiceDescriptor>> {
        self.check(FakeOperation::ListServices).await?;
        Ok(self.state.lock().await.services.values().cloned().collect())
    }

    async fn create_service(&self, service: &ServiceDescriptor) -> BackendResult<()> {
        self.check(FakeOperation::CreateService).await?;
        let mut state = self.state.lock().await;
        if state.services.contains_key(&service.name) {
            return Err(BackendError::BackendUnavailable(format!(
                "service {:?} already exists",
                service.name
            )));
        }
        state.services.insert(service.name.clone(), service.clone());
        Ok(())
    }

    async fn read_service(&self, name: &str) -> BackendResult<ServiceDescriptor> {
        self.check(FakeOperation::ReadService).await?;
        self.state
            .lock()
            .await
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("service {name:?} not found")))
    }

    async fn update_service(&self, service: &ServiceDescriptor) -> BackendResult<()> {
        self.check(FakeOperation::UpdateService).await?;
        let mut state = self.state.lock().await;
        match state.services.get_mut(&service.name) {
            Some(existing) => {
                *existing = service.clone();
                Ok(())
            }
            None => Err(BackendError::NotFound(format!(
                "no registered metadata for service {:?}",
                service.name
            ))),
        }
    }

    async fn delete_service(&self, name: &str) -> BackendResult<()> {
        self.check(FakeOperation::DeleteService).await?;
        self.state
            .lock()
            .await
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("service {name:?} not found")))
    }

    fn cluster_client(&self) -> &C {
        &self.cluster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use faasgrid_cluster::MemoryCluster;

    fn service(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            image: "alpine".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lifecycle() {
        let fake = FakeBackend::new(MemoryCluster::new());
        fake.create_service(&service("s1")).await.unwrap();
        assert_eq!(fake.read_service("s1").await.unwrap().image, "alpine");
        assert_eq!(fake.list_services().await.unwrap().len(), 1);

        let mut updated = service("s1");
        updated.image = "busybox".to_string();
        fake.update_service(&updated).await.unwrap();
        assert_eq!(fake.read_service("s1").await.unwrap().image, "busybox");

        fake.delete_service("s1").await.unwrap();
        let err = fake.read_service("s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn failure_switches() {
        let fake = FakeBackend::new(MemoryCluster::new());
        fake.fail_on(FakeOperation::CreateService).await;
        let err = fake.create_service(&service("s1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert!(fake.list_services().await.unwrap().is_empty());

        fake.recover(FakeOperation::CreateService).await;
        fake.create_service(&service("s1")).await.unwrap();
        assert_eq!(fake.get_info().await.unwrap().name, "fake-backend");
    }
}
