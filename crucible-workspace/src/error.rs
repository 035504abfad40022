use thiserror::Error;

use crucible_orchestrator::OrchestratorError;
use crucible_store::StoreError;

/// Errors from workspace projection and extraction.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A requested path does not fit the `/workspace/...` contract.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A requested (path, hash) pair has no blob in the store.
    #[error("no stored content for {path} ({hash})")]
    MissingBlob { path: String, hash: String },

    /// The workspace listing could not be produced or parsed.
    #[error("workspace listing failed: {0}")]
    Listing(String),

    /// A file transfer into or out of the worker failed.
    #[error("transfer failed for {path}: {detail}")]
    Transfer { path: String, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}
