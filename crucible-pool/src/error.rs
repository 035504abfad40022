use thiserror::Error;

use crucible_core::BrokerError;

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No worker could be produced before the caller's deadline.
    #[error("no worker available: {0}")]
    Unavailable(String),

    /// The pool task has shut down.
    #[error("pool is shut down")]
    Closed,
}

impl From<PoolError> for BrokerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Unavailable(s) => BrokerError::Unavailable(s),
            PoolError::Closed => BrokerError::Internal("pool is shut down".into()),
        }
    }
}
