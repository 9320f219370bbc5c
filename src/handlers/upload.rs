//! Upload endpoint handlers.
//!
//! `POST /upload/{repository}[/{path...}]` accepts a multipart form
//! with a single `file` field.  The final namespace path is the URL
//! path joined with the client-supplied filename.  The body streams
//! chunk-by-chunk into the blob store; the size limit is enforced
//! during streaming, so an oversized upload is rejected without ever
//! buffering the whole payload.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;

use crate::errors::IngotError;
use crate::metrics::UPLOAD_BYTES_TOTAL;
use crate::AppState;

/// `POST /upload/{repository}` -- upload into the repository root.
#[utoipa::path(
    post,
    path = "/upload/{repository}",
    tag = "Upload",
    operation_id = "UploadToRoot",
    params(("repository" = String, Path, description = "Target repository")),
    responses(
        (status = 200, description = "Upload accepted and published"),
        (status = 400, description = "Invalid repository, path, or multipart body"),
        (status = 413, description = "Upload exceeds the configured size limit")
    )
)]
pub async fn upload_to_root(
    State(state): State<Arc<AppState>>,
    Path(repository): Path<String>,
    multipart: Multipart,
) -> Result<Response, IngotError> {
    handle_upload(state, repository, None, multipart).await
}

/// `POST /upload/{repository}/{path}` -- upload into a subdirectory.
#[utoipa::path(
    post,
    path = "/upload/{repository}/{path}",
    tag = "Upload",
    operation_id = "UploadToPath",
    params(
        ("repository" = String, Path, description = "Target repository"),
        ("path" = String, Path, description = "Directory path within the repository")
    ),
    responses(
        (status = 200, description = "Upload accepted and published"),
        (status = 400, description = "Invalid repository, path, or multipart body"),
        (status = 413, description = "Upload exceeds the configured size limit")
    )
)]
pub async fn upload_to_path(
    State(state): State<Arc<AppState>>,
    Path((repository, path)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Response, IngotError> {
    handle_upload(state, repository, Some(path), multipart).await
}

/// Stream the `file` multipart field into the blob store and publish
/// the namespace entry.
async fn handle_upload(
    state: Arc<AppState>,
    repository: String,
    dir: Option<String>,
    mut multipart: Multipart,
) -> Result<Response, IngotError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| IngotError::InvalidName {
                message: "multipart 'file' field has no filename".to_string(),
            })?;

        let target = match dir.as_deref().map(|d| d.trim_matches('/')) {
            Some(d) if !d.is_empty() => format!("{d}/{filename}"),
            _ => filename.clone(),
        };

        let mut upload = state.service.begin(&repository, &target)?;
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            upload.write(&chunk)?;
        }
        let result = upload.finish().await?;

        counter!(UPLOAD_BYTES_TOTAL).increment(result.blob.size);

        let body = serde_json::json!({
            "repository": result.repository,
            "path": result.path,
            "filename": filename,
            "size": result.blob.size,
            "hash": result.blob.hash,
        })
        .to_string();

        return Ok((
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        )
            .into_response());
    }

    Err(IngotError::InvalidName {
        message: "multipart body has no 'file' field".to_string(),
    })
}

/// A malformed or truncated multipart body is a client error.
fn multipart_error(err: axum::extract::multipart::MultipartError) -> IngotError {
    IngotError::InvalidName {
        message: format!("malformed multipart body: {err}"),
    }
}
