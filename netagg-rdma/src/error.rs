pub type Result<T> = std::result::Result<T, RdmaError>;

/// Errors from the verbs layer.
///
/// `Setup` covers everything up to a connected queue pair; `Post` covers
/// failures submitting or reaping work requests afterwards. The engine
/// maps these onto its own taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    #[error("RDMA setup failed: {0}")]
    Setup(String),

    #[error("RDMA post failed: {0}")]
    Post(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RdmaError {
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    pub fn post(msg: impl Into<String>) -> Self {
        Self::Post(msg.into())
    }
}
