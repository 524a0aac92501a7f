//! Transport backends.
//!
//! A backend owns the worker threads that move job slices over the
//! network. Selection is a closed set: the dummy backend (tests,
//! overhead measurement), the UDP backend, and the RDMA backend behind
//! the `rdma` cargo feature.

pub mod dummy;
pub mod udp;

#[cfg(feature = "rdma")]
pub mod rdma;

use crate::config::BackendKind;
use crate::context::WorkerHandle;
use crate::error::Result;

#[cfg(not(feature = "rdma"))]
use crate::error::NetaggError;

/// The running transport, one variant per backend kind.
pub(crate) enum Backend {
    Dummy(dummy::DummyBackend),
    Udp(udp::UdpBackend),
    #[cfg(feature = "rdma")]
    Rdma(rdma::RdmaBackend),
}

impl Backend {
    /// Set up the selected transport and launch its worker threads. The
    /// context must already be in the Running state or the threads would
    /// exit immediately.
    pub(crate) fn start(handle: WorkerHandle) -> Result<Self> {
        match handle.config().general.backend {
            BackendKind::Dummy => Ok(Backend::Dummy(dummy::DummyBackend::start(handle)?)),
            BackendKind::Udp => Ok(Backend::Udp(udp::UdpBackend::start(handle)?)),
            #[cfg(feature = "rdma")]
            BackendKind::Rdma => Ok(Backend::Rdma(rdma::RdmaBackend::start(handle)?)),
            #[cfg(not(feature = "rdma"))]
            BackendKind::Rdma => Err(NetaggError::config(
                "backend 'rdma' requires building with the `rdma` feature",
            )),
        }
    }

    /// Join all worker threads. The context state must no longer be
    /// Running, otherwise this blocks forever.
    pub(crate) fn shutdown(self) {
        match self {
            Backend::Dummy(b) => b.shutdown(),
            Backend::Udp(b) => b.shutdown(),
            #[cfg(feature = "rdma")]
            Backend::Rdma(b) => b.shutdown(),
        }
    }
}
