use thiserror::Error;

use crucible_core::BrokerError;

/// Errors from the file store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No metadata entry (or no blob) for the requested identity.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entry's expiry instant has passed.
    #[error("expired: {0}")]
    Expired(String),

    /// The entry's remaining download count is zero.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// A tenant id or filename that cannot form a storage path.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for BrokerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(s) => BrokerError::NotFound(s),
            StoreError::Expired(s) => BrokerError::Expired(s),
            StoreError::QuotaExhausted(s) => BrokerError::QuotaExhausted(s),
            StoreError::InvalidKey(s) => BrokerError::InvalidArgument(s),
            other => BrokerError::Internal(other.to_string()),
        }
    }
}
