use std::collections::BTreeMap;

use crucible_core::{ChatId, ContentHash, FileMetadata};

/// One execute request, after the HTTP layer has decoded the envelope.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub source_code: String,
    /// Declared workspace: absolute `/workspace/...` path → content hash.
    pub files: BTreeMap<String, String>,
    /// Extra environment for the user program.
    pub env: BTreeMap<String, String>,
    pub chat_id: Option<String>,
    /// Keep undeclared files from a prior session of the same chat.
    pub persistent_workspace: bool,
    /// Download quota for produced files; the configured global default
    /// applies when unset.
    pub max_downloads: Option<u64>,
    pub expires_days: Option<u64>,
    pub expires_seconds: Option<u64>,
}

/// Result of a successful execution. A non-zero `exit_code` is still a
/// success: it is the user program's exit status.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub files: BTreeMap<String, ContentHash>,
    pub files_metadata: BTreeMap<String, FileMetadata>,
    pub chat_id: ChatId,
}
