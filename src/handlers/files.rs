//! Download, list, and delete handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde::Deserialize;

use crate::errors::IngotError;
use crate::metrics::DOWNLOAD_BYTES_TOTAL;
use crate::AppState;

/// Query parameters accepted by the entry listing endpoint.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Only entries whose path starts with this prefix are returned.
    #[serde(default)]
    pub prefix: String,
}

/// `GET /download/{repository}/{path}` -- verified blob read.
#[utoipa::path(
    get,
    path = "/download/{repository}/{path}",
    tag = "Files",
    operation_id = "DownloadFile",
    params(
        ("repository" = String, Path, description = "Repository name"),
        ("path" = String, Path, description = "Entry path within the repository")
    ),
    responses(
        (status = 200, description = "Blob bytes, integrity-verified"),
        (status = 404, description = "No such entry or blob"),
        (status = 500, description = "Stored bytes failed integrity verification")
    )
)]
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((repository, path)): Path<(String, String)>,
) -> Result<Response, IngotError> {
    let (entry, data) = state.service.download(&repository, &path).await?;

    counter!(DOWNLOAD_BYTES_TOTAL).increment(entry.blob.size);

    Ok((
        StatusCode::OK,
        [
            ("content-type", "application/octet-stream".to_string()),
            ("content-length", entry.blob.size.to_string()),
            ("etag", format!("\"{}\"", entry.blob.hash)),
            ("x-ingot-content-hash", entry.blob.hash),
        ],
        axum::body::Body::from(data),
    )
        .into_response())
}

/// `GET /list/{repository}?prefix=` -- list entries, ordered by path.
#[utoipa::path(
    get,
    path = "/list/{repository}",
    tag = "Files",
    operation_id = "ListEntries",
    params(
        ("repository" = String, Path, description = "Repository name"),
        ("prefix" = Option<String>, Query, description = "Path prefix filter")
    ),
    responses(
        (status = 200, description = "Entries matching the prefix"),
        (status = 400, description = "Invalid repository name")
    )
)]
pub async fn list_entries(
    State(state): State<Arc<AppState>>,
    Path(repository): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Response, IngotError> {
    let entries = state.service.list(&repository, &params.prefix).await?;

    let listed: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|entry| {
            serde_json::json!({
                "path": entry.path,
                "size": entry.blob.size,
                "hash": entry.blob.hash,
                "updated_at": entry.updated_at,
            })
        })
        .collect();

    let body = serde_json::json!({
        "repository": repository,
        "prefix": params.prefix,
        "entries": listed,
    })
    .to_string();

    Ok((StatusCode::OK, [("content-type", "application/json")], body).into_response())
}

/// `GET /list` -- list repositories with entry counts.
///
/// Repositories are implicit: one appears here exactly while at least
/// one entry references it.
#[utoipa::path(
    get,
    path = "/list",
    tag = "Files",
    operation_id = "ListRepositories",
    responses((status = 200, description = "Repositories with entry counts"))
)]
pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
) -> Result<Response, IngotError> {
    let repositories = state.service.repositories().await?;

    let body = serde_json::json!({
        "repositories": repositories,
    })
    .to_string();

    Ok((StatusCode::OK, [("content-type", "application/json")], body).into_response())
}

/// `DELETE /delete/{repository}/{path}` -- remove an entry.
///
/// The referenced blob's file is garbage-collected when the entry was
/// its last reference.
#[utoipa::path(
    delete,
    path = "/delete/{repository}/{path}",
    tag = "Files",
    operation_id = "DeleteFile",
    params(
        ("repository" = String, Path, description = "Repository name"),
        ("path" = String, Path, description = "Entry path within the repository")
    ),
    responses(
        (status = 204, description = "Entry removed"),
        (status = 404, description = "No such entry")
    )
)]
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((repository, path)): Path<(String, String)>,
) -> Result<Response, IngotError> {
    state.service.remove(&repository, &path).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
