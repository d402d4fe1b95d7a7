//! faasgrid-cluster: access to the Kubernetes API.
//!
//! Every component above this crate talks to the cluster through the
//! [`ClusterApi`] trait, which has two implementations:
//!
//! - [`KubeCluster`]: a thin wrapper over a `kube::Client`
//! - [`MemoryCluster`]: an in-process object store with failure injection,
//!   an emulated OpenFaaS operator and a pod-event feed (for tests and the
//!   fake backend)
//!
//! # Architecture
//!
//! ```text
//! ClusterApi
//!   ├── get / list / create / replace / delete / delete_collection  (namespaced, typed)
//!   ├── list_nodes                                                   (cluster-scoped)
//!   ├── watch_pods                                                   (label-filtered event stream)
//!   └── server_version
//! ```

pub mod api;
pub mod client;
pub mod crd;
pub mod error;
pub mod memory;
pub mod selector;

pub use api::{ClusterApi, ClusterObject, PodEvent, ServerVersion, object_name};
pub use client::KubeCluster;
pub use crd::{
    Function, FunctionResources, FunctionSpec, KnativeService, KnativeServiceSpec, RevisionSpec,
    RevisionTemplateSpec,
};
pub use error::{ClusterError, ClusterResult};
pub use memory::{MemoryCluster, Verb, pod_in_phase};
pub use selector::LabelSelector;
