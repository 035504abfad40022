use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use crucible_core::BrokerError;

use super::error::ApiError;
use super::schemas::{ExpireResponse, FileRef, UploadResponse};
use super::AppState;

/// `POST /v1/upload` -- multipart upload of one file into the session.
///
/// Fields: `chat_id`, `upload` (the file), and optionally `max_downloads`,
/// `expires_days`, `expires_seconds`.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut chat_id: Option<String> = None;
    let mut upload: Option<(String, bytes::Bytes)> = None;
    let mut max_downloads: Option<u64> = None;
    let mut expires_days: Option<u64> = None;
    let mut expires_seconds: Option<u64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| BrokerError::InvalidArgument(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "chat_id" => chat_id = Some(read_text(field).await?),
            "upload" => {
                let filename = field
                    .file_name()
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        BrokerError::InvalidArgument("upload field needs a filename".to_owned())
                    })?;
                let data = field.bytes().await.map_err(|e| {
                    BrokerError::InvalidArgument(format!("could not read upload: {e}"))
                })?;
                upload = Some((filename, data));
            }
            "max_downloads" => max_downloads = Some(read_number(field, "max_downloads").await?),
            "expires_days" => expires_days = Some(read_number(field, "expires_days").await?),
            "expires_seconds" => {
                expires_seconds = Some(read_number(field, "expires_seconds").await?);
            }
            _ => {}
        }
    }

    let (filename, data) = upload
        .ok_or_else(|| BrokerError::InvalidArgument("missing upload field".to_owned()))?;
    info!(filename = %filename, bytes = data.len(), "upload received");

    let (chat_id, hash, metadata) = state
        .broker
        .upload(
            chat_id.as_deref(),
            &filename,
            data,
            max_downloads,
            expires_days,
            expires_seconds,
        )
        .await?;

    Ok(Json(UploadResponse {
        file_hash: hash.to_string(),
        filename,
        chat_id: chat_id.to_string(),
        metadata,
    }))
}

/// `POST /v1/download` -- stream a stored file back, consuming one
/// download.
pub async fn download(
    State(state): State<AppState>,
    Json(body): Json<FileRef>,
) -> Result<Response, ApiError> {
    let (_, bytes) = state
        .broker
        .download(&body.chat_id, &body.filename, &body.file_hash)
        .await?;

    let content_type = mime_guess::from_path(&body.filename)
        .first_or_octet_stream()
        .to_string();
    let disposition = format!("attachment; filename=\"{}\"", body.filename);
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// `POST /v1/expire` -- kill a stored file immediately.
pub async fn expire(
    State(state): State<AppState>,
    Json(body): Json<FileRef>,
) -> Result<Json<ExpireResponse>, ApiError> {
    state
        .broker
        .expire(&body.chat_id, &body.filename, &body.file_hash)
        .await?;
    Ok(Json(ExpireResponse { success: true }))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, BrokerError> {
    field
        .text()
        .await
        .map_err(|e| BrokerError::InvalidArgument(format!("malformed multipart field: {e}")))
}

async fn read_number(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<u64, BrokerError> {
    read_text(field).await?.trim().parse().map_err(|_| {
        BrokerError::InvalidArgument(format!("field {name} must be a non-negative integer"))
    })
}
