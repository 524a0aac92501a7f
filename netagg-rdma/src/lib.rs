//! Low-level ibverbs plumbing for the netagg engine.
//!
//! Uses raw `ibverbs-sys` FFI (no safe wrapper). This crate knows nothing
//! about jobs or aggregation; it owns device discovery, the fixed-address
//! huge-page registered region, unreliable-connected queue-pair bringup,
//! and work-request post/poll wrappers. The engine crate drives it.

pub mod endpoint;
pub mod error;
pub mod gid;
pub mod mr;
pub mod numa;
pub mod qp;

pub use endpoint::RdmaEndpoint;
pub use error::{RdmaError, Result};
pub use mr::PinnedRegion;
pub use qp::{CompletionQueue, PathMtu, QueuePair};

// Re-exported so the engine can build work requests and inspect
// completions without naming the sys crate directly.
pub use ibverbs_sys;
