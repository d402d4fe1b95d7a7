//! faasgrid-backends: service lifecycle on interchangeable serverless backends.
//!
//! Every driver implements [`ServerlessBackend`]: it validates and compiles
//! a [`ServiceDescriptor`](faasgrid_core::ServiceDescriptor), persists the
//! Metadata Record, and submits the backend-native resource. Multi-step
//! operations run as a [`Saga`]; a failed step rolls back the steps that
//! committed before it and the caller sees the original error.
//!
//! # Architecture
//!
//! ```text
//! Backend (selected once from GlobalConfig.serverless_backend)
//!   ├── Kubernetes   PodTemplate + optional Deployment/Service/HPA exposure
//!   │                + optional image prefetch
//!   ├── Knative      serving.knative.dev/v1 Service
//!   ├── OpenFaas     openfaas.com/v1 Function, patched operator Deployment
//!   └── Fake         in-memory table with failure switches
//!
//! each driver
//!   ├── MetadataStore      (faasgrid-state, source of truth for reads)
//!   ├── compile()          (faasgrid-compiler, pod spec)
//!   └── ClusterApi         (faasgrid-cluster, KubeCluster or MemoryCluster)
//! ```
//!
//! Only the Kubernetes and Knative drivers can route synchronous requests;
//! see [`Backend::proxy_director`].

pub mod backend;
pub mod error;
pub mod expose;
pub mod fake;
pub mod knative;
pub mod kubernetes;
pub mod openfaas;
pub mod proxy;
pub mod saga;

pub use backend::{Backend, BackendInfo, BackendKind, ServerlessBackend, SyncBackend};
pub use error::{BackendError, BackendResult, ErrorKind};
pub use fake::{FakeBackend, FakeOperation};
pub use knative::KnativeBackend;
pub use kubernetes::KubernetesBackend;
pub use openfaas::OpenFaasBackend;
pub use proxy::ProxyDirector;
pub use saga::Saga;
