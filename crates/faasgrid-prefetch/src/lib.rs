//! faasgrid-prefetch: pull an image onto every eligible worker node.
//!
//! A [`PrefetchSession`] owns one throwaway DaemonSet running the image,
//! a pod watch scoped by a random pod-group label, and a counter of
//! distinct pods seen `Running`. The watch task signals completion through
//! a one-shot channel; the session owner tears the watch and the DaemonSet
//! down once the counter reaches the number of eligible nodes, the wait
//! times out, or the session is cancelled or dropped.
//!
//! Sessions are independent: concurrent sessions, even for the same image,
//! share no state.

pub mod daemonset;
pub mod error;
pub mod session;

pub use error::{PrefetchError, PrefetchResult};
pub use session::{ImagePrefetcher, PrefetchReport, PrefetchRequest, PrefetchSession};
