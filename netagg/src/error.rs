pub type Result<T> = std::result::Result<T, NetaggError>;

/// Engine error taxonomy.
///
/// Timeouts are not represented here: a lost packet is recovered by
/// retransmission inside the worker loop and only shows up in the stats.
/// A job cancelled by `stop()` surfaces through `JobStatus::Failed`, not
/// through an error value.
#[derive(Debug, thiserror::Error)]
pub enum NetaggError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid lifecycle state: {operation} requires {required}, context is {actual}")]
    State {
        operation: &'static str,
        required: &'static str,
        actual: &'static str,
    },

    #[error("transport setup failed: {0}")]
    TransportSetup(String),

    #[error("transport post failed: {0}")]
    TransportPost(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("controller RPC '{rpc}' failed: {reason}")]
    Controller { rpc: &'static str, reason: String },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetaggError {
    /// Create a `Config` error from a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a `TransportSetup` error from a message.
    pub fn transport_setup(msg: impl Into<String>) -> Self {
        Self::TransportSetup(msg.into())
    }

    /// Create a `TransportPost` error from a message.
    pub fn transport_post(msg: impl Into<String>) -> Self {
        Self::TransportPost(msg.into())
    }

    /// Create a `Protocol` error from a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a `Controller` error for the named RPC.
    pub fn controller(rpc: &'static str, reason: impl Into<String>) -> Self {
        Self::Controller {
            rpc,
            reason: reason.into(),
        }
    }
}

#[cfg(feature = "rdma")]
impl From<netagg_rdma::RdmaError> for NetaggError {
    fn from(e: netagg_rdma::RdmaError) -> Self {
        match e {
            netagg_rdma::RdmaError::Post(msg) => Self::TransportPost(msg),
            other => Self::TransportSetup(other.to_string()),
        }
    }
}
