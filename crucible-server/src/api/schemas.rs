use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crucible_core::FileMetadata;
use crucible_broker::ExecuteResult;

/// Body of `POST /v1/execute`, after envelope canonicalisation. Unknown
/// fields are ignored, matching tolerant clients.
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteBody {
    pub source_code: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub persistent_workspace: bool,
    #[serde(default)]
    pub max_downloads: Option<u64>,
    #[serde(default)]
    pub expires_days: Option<u64>,
    #[serde(default)]
    pub expires_seconds: Option<u64>,
    /// Accepted for compatibility; the server-side bound applies.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub files: BTreeMap<String, String>,
    pub files_metadata: BTreeMap<String, FileMetadata>,
    pub chat_id: String,
}

impl From<ExecuteResult> for ExecuteResponse {
    fn from(result: ExecuteResult) -> Self {
        Self {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            files: result
                .files
                .into_iter()
                .map(|(path, hash)| (path, hash.to_string()))
                .collect(),
            files_metadata: result.files_metadata,
            chat_id: result.chat_id.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_hash: String,
    pub filename: String,
    pub chat_id: String,
    pub metadata: FileMetadata,
}

#[derive(Debug, Deserialize)]
pub struct FileRef {
    pub chat_id: String,
    pub file_hash: String,
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct ExpireResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct ParseCustomToolRequest {
    pub tool_source_code: String,
}

#[derive(Debug, Serialize)]
pub struct ParseCustomToolResponse {
    pub tool_name: String,
    pub tool_input_schema_json: String,
    pub tool_description: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteCustomToolRequest {
    pub tool_source_code: String,
    pub tool_input_json: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteCustomToolResponse {
    pub tool_output_json: String,
}
