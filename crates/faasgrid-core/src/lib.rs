//! faasgrid-core: shared types for the faasgrid control plane.
//!
//! - [`ServiceDescriptor`]: the backend-agnostic definition of a function
//! - [`GlobalConfig`]: read-only process configuration
//! - [`ResourceQuantity`]: Kubernetes resource quantity parsing

pub mod config;
pub mod constants;
pub mod error;
pub mod quantity;
pub mod types;

pub use config::GlobalConfig;
pub use error::{CoreError, CoreResult};
pub use quantity::ResourceQuantity;
pub use types::*;
