//! Typed error taxonomy for Ingot.
//!
//! Every variant carries a stable error code and a specific HTTP status,
//! so callers can distinguish "fix your request" from "try again".  The
//! enum implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(IngotError::SizeLimitExceeded { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Ingot error kinds.
#[derive(Debug, Error)]
pub enum IngotError {
    /// Malformed repository name or path (empty, traversal segments, ...).
    #[error("{message}")]
    InvalidName { message: String },

    /// The streaming upload exceeded the configured size limit.
    #[error("Upload exceeds the maximum allowed size of {limit} bytes")]
    SizeLimitExceeded { limit: u64 },

    /// No namespace entry exists at the requested (repository, path).
    #[error("No entry found at {repository}/{path}")]
    EntryNotFound { repository: String, path: String },

    /// The referenced blob is missing from the blob store.
    #[error("Blob {hash} does not exist")]
    BlobNotFound { hash: String },

    /// Stored bytes no longer hash to their blob reference.
    #[error("Blob {hash} failed integrity verification")]
    IntegrityViolation { hash: String },

    /// Delete attempted on a blob still referenced by the namespace.
    #[error("Blob {hash} is still referenced by {count} namespace entries")]
    StillReferenced { hash: String, count: u64 },

    /// Underlying filesystem failure.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error, please try again")]
    Internal(#[from] anyhow::Error),
}

impl IngotError {
    /// Return the stable error code string used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            IngotError::InvalidName { .. } => "InvalidName",
            IngotError::SizeLimitExceeded { .. } => "SizeLimitExceeded",
            IngotError::EntryNotFound { .. } => "NotFound",
            IngotError::BlobNotFound { .. } => "NotFound",
            IngotError::IntegrityViolation { .. } => "IntegrityViolation",
            IngotError::StillReferenced { .. } => "StillReferenced",
            IngotError::IoFailure(_) => "IOFailure",
            IngotError::Internal(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngotError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            IngotError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            IngotError::EntryNotFound { .. } => StatusCode::NOT_FOUND,
            IngotError::BlobNotFound { .. } => StatusCode::NOT_FOUND,
            IngotError::IntegrityViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            IngotError::StillReferenced { .. } => StatusCode::CONFLICT,
            IngotError::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IngotError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngotError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "request_id": request_id,
        })
        .to_string();

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-ingot-request-id", request_id),
                ("date", date),
                ("server", "Ingot".to_string()),
            ],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_uppercase());
    }

    #[test]
    fn test_status_codes() {
        let err = IngotError::InvalidName {
            message: "bad".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = IngotError::SizeLimitExceeded { limit: 1024 };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.code(), "SizeLimitExceeded");

        let err = IngotError::StillReferenced {
            hash: "ab".repeat(32),
            count: 2,
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_found_variants_share_code() {
        let entry = IngotError::EntryNotFound {
            repository: "docs".into(),
            path: "a/b".into(),
        };
        let blob = IngotError::BlobNotFound {
            hash: "00".repeat(32),
        };
        assert_eq!(entry.code(), "NotFound");
        assert_eq!(blob.code(), "NotFound");
    }
}
