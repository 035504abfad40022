use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crucible_core::{validate_workspace_path, ChatId, ContentHash, FileMetadata, WorkerName};
use crucible_orchestrator::Orchestrator;
use crucible_store::{FileStore, StoreError};

use crate::error::WorkspaceError;
use crate::wire;

/// Result of extracting a worker's post-execution workspace.
#[derive(Debug, Default, Clone)]
pub struct ExtractOutcome {
    /// Every file present after execution, by content hash.
    pub files: BTreeMap<String, ContentHash>,
    /// Store metadata for files the execution produced or changed.
    pub files_metadata: BTreeMap<String, FileMetadata>,
}

/// Reconciles a declared file set into a worker's `/workspace` and lifts
/// the resulting workspace back into the file store.
pub struct WorkspaceManager {
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<FileStore>,
}

impl WorkspaceManager {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, store: Arc<FileStore>) -> Self {
        Self {
            orchestrator,
            store,
        }
    }

    /// Hash-list the worker's current workspace.
    pub async fn list(
        &self,
        worker: &WorkerName,
    ) -> Result<BTreeMap<String, ContentHash>, WorkspaceError> {
        let output = self
            .orchestrator
            .exec(worker, &wire::list_command(), None)
            .await?;
        if !output.success() {
            return Err(WorkspaceError::Listing(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        wire::parse_listing(&output.stdout)
    }

    /// Make `worker:/workspace` contain exactly the files in `requested`
    /// (by content), reusing whatever already matches by hash.
    ///
    /// With `persistent` set, files the request does not declare survive;
    /// otherwise they are removed. On any failure the worker must be
    /// considered poisoned and destroyed by the caller.
    #[instrument(skip(self, requested), fields(worker = %worker, chat_id = %chat_id))]
    pub async fn project(
        &self,
        worker: &WorkerName,
        chat_id: &ChatId,
        requested: &BTreeMap<String, ContentHash>,
        persistent: bool,
    ) -> Result<(), WorkspaceError> {
        for path in requested.keys() {
            validate_workspace_path(path)
                .map_err(|e| WorkspaceError::InvalidPath(e.to_string()))?;
        }

        let current = self.list(worker).await?;

        let to_remove: Vec<&String> = if persistent {
            Vec::new()
        } else {
            current
                .keys()
                .filter(|path| !requested.contains_key(*path))
                .collect()
        };
        let to_add: Vec<(&String, &ContentHash)> = requested
            .iter()
            .filter(|(path, hash)| current.get(*path) != Some(*hash))
            .collect();
        debug!(
            present = current.len(),
            removing = to_remove.len(),
            adding = to_add.len(),
            "reconciling workspace"
        );

        for path in to_remove {
            let output = self
                .orchestrator
                .exec(worker, &wire::remove_command(path), None)
                .await?;
            if !output.success() {
                return Err(WorkspaceError::Transfer {
                    path: path.clone(),
                    detail: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
        }

        for (path, hash) in to_add {
            // Projection reads never consume download quota.
            let (_, bytes) = self
                .store
                .get(chat_id, basename(path), hash, false)
                .await
                .map_err(|e| match e {
                    StoreError::NotFound(_) => WorkspaceError::MissingBlob {
                        path: path.clone(),
                        hash: hash.to_string(),
                    },
                    other => WorkspaceError::Store(other),
                })?;
            let output = self
                .orchestrator
                .exec(worker, &wire::upload_command(path), Some(bytes))
                .await?;
            if !output.success() {
                return Err(WorkspaceError::Transfer {
                    path: path.clone(),
                    detail: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
        }
        Ok(())
    }

    /// Lift the post-execution workspace into the store.
    ///
    /// Files whose hash matches what was projected are not re-uploaded;
    /// everything new or changed is stored under this session with the
    /// request-derived quota and expiry. The returned map covers the whole
    /// final workspace, metadata only the fresh entries.
    #[instrument(skip(self, projected), fields(worker = %worker, chat_id = %chat_id))]
    pub async fn extract(
        &self,
        worker: &WorkerName,
        chat_id: &ChatId,
        projected: &BTreeMap<String, ContentHash>,
        remaining_downloads: Option<u64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ExtractOutcome, WorkspaceError> {
        let listed = self.list(worker).await?;
        let mut outcome = ExtractOutcome {
            files: listed.clone(),
            files_metadata: BTreeMap::new(),
        };

        for (path, listed_hash) in &listed {
            if projected.get(path) == Some(listed_hash) {
                continue;
            }
            let output = self
                .orchestrator
                .exec(worker, &wire::download_command(path), None)
                .await?;
            if !output.success() {
                return Err(WorkspaceError::Transfer {
                    path: path.clone(),
                    detail: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }

            let (hash, meta) = self
                .store
                .put(
                    chat_id,
                    basename(path),
                    output.stdout,
                    remaining_downloads,
                    expires_at,
                )
                .await?;
            // The stored hash is authoritative; the listing is only a diff
            // hint.
            outcome.files.insert(path.clone(), hash);
            outcome.files_metadata.insert(path.clone(), meta);
        }

        info!(
            files = outcome.files.len(),
            stored = outcome.files_metadata.len(),
            "workspace extracted"
        );
        Ok(outcome)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
