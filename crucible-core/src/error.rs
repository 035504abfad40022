use thiserror::Error;

/// Top-level, user-visible error taxonomy of the broker.
///
/// Every public operation fails with one of these kinds. A user program
/// exiting non-zero is *not* an error: it is a successful execution whose
/// result carries the exit code.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed request: missing `chat_id`, bad path, bad hash, bad schema.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pool could not produce a worker before the deadline.
    #[error("no worker available: {0}")]
    Unavailable(String),

    /// The requested file set could not be materialized in the worker.
    #[error("workspace projection failed: {0}")]
    WorkspaceProjectionFailed(String),

    /// The execution machinery itself failed (exec transport, worker died).
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Unknown blob or metadata entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// The file's expiry instant has passed.
    #[error("file expired: {0}")]
    Expired(String),

    /// The file's remaining download count is zero.
    #[error("download quota exhausted: {0}")]
    QuotaExhausted(String),

    /// The custom tool source could not be parsed into a schema.
    #[error("invalid tool: {0}")]
    InvalidTool(String),

    /// The custom tool returned a value that does not serialize to JSON.
    #[error("invalid tool output: {0}")]
    InvalidToolOutput(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable machine-readable name of the error kind, for response bodies
    /// and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Unavailable(_) => "Unavailable",
            Self::WorkspaceProjectionFailed(_) => "WorkspaceProjectionFailed",
            Self::ExecutionFailed(_) => "ExecutionFailed",
            Self::NotFound(_) => "NotFound",
            Self::Expired(_) => "Expired",
            Self::QuotaExhausted(_) => "QuotaExhausted",
            Self::InvalidTool(_) => "InvalidTool",
            Self::InvalidToolOutput(_) => "InvalidToolOutput",
            Self::Internal(_) => "Internal",
        }
    }
}
