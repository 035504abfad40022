use thiserror::Error;

/// Kind-tagged errors from the container orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Transport-level failure talking to the control plane.
    #[error("connection error: {0}")]
    Connection(String),

    /// The control plane answered but reported a server-side fault.
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A worker with this name already exists. Fatal for the attempt;
    /// the caller regenerates the name.
    #[error("worker already exists: {0}")]
    AlreadyExists(String),

    /// The named worker does not exist.
    #[error("worker not found: {0}")]
    NotFound(String),

    /// The exec channel into a worker broke mid-flight.
    #[error("exec failed: {0}")]
    Exec(String),

    /// Anything else the backend reports.
    #[error("orchestrator backend error: {0}")]
    Backend(String),
}

impl OrchestratorError {
    /// Whether retrying the same call can reasonably succeed.
    ///
    /// Connection resets, server faults, and timeouts are transient;
    /// name conflicts and missing workers are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Unavailable(_) | Self::Timeout(_)
        )
    }
}
