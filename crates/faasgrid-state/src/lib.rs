//! faasgrid-state: durable Metadata Records.
//!
//! Each service owns one ConfigMap, named after the service, holding two
//! keys: the YAML-serialized Service Descriptor and the raw entrypoint
//! script. The record is the source of truth when listing or reading
//! services; backend-native resources are derived from it.
//!
//! The [`MetadataStore`] is generic over [`ClusterApi`](faasgrid_cluster::ClusterApi)
//! and is `Clone` whenever the cluster handle is, so it can be shared across
//! async tasks (compensations run on spawned tasks).

pub mod error;
pub mod record;
pub mod store;

pub use error::{StateError, StateResult};
pub use record::MetadataRecord;
pub use store::MetadataStore;
