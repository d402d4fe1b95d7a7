//! faasgrid-compiler: translate a Service Descriptor into a pod spec.
//!
//! [`compile`] is pure: it reads the descriptor and the global
//! configuration and never talks to the cluster. Every backend embeds its
//! output into its own native resource.
//!
//! # Layout of a compiled pod
//!
//! ```text
//! containers[0]   faasgrid-container   image, watchdog entrypoint, limits, env
//! containers[1]   rclone-container     only with a mount binding
//! initContainers  supervisor-container only when offloaded
//! volumes         config (always) + bin PVC (normal) | share emptyDir (offload)
//!                 + shared/ephemeral emptyDirs (mount)
//! ```

pub mod error;
pub mod mount;
pub mod offload;
pub mod pod;

pub use error::{CompileError, CompileResult};
pub use pod::compile;
