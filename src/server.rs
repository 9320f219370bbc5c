//! Axum router construction and route mapping.
//!
//! The [`app`] function wires every endpoint to its handler and returns
//! a ready-to-serve [`axum::Router`]. Entry paths contain slashes, so
//! the download and delete routes use wildcard captures.

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::generate_request_id;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the Ingot HTTP API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ingot",
        version = "0.1.0",
        description = "Content-addressed blob storage with a repository/path namespace"
    ),
    paths(
        health_check,
        crate::handlers::upload::upload_to_root,
        crate::handlers::upload::upload_to_path,
        crate::handlers::files::download_file,
        crate::handlers::files::list_entries,
        crate::handlers::files::list_repositories,
        crate::handlers::files::delete_file,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Streaming multipart uploads"),
        (name = "Files", description = "Download, listing, and deletion"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    // Infrastructure endpoints are mounted per the observability config.
    let mut router = Router::new();
    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .route("/openapi.json", get(openapi_spec))
        // Uploads: the URL names a directory, the multipart filename
        // completes the entry path.
        .route(
            "/upload/:repository",
            post(crate::handlers::upload::upload_to_root),
        )
        .route(
            "/upload/:repository/*path",
            post(crate::handlers::upload::upload_to_path),
        )
        // Reads.
        .route(
            "/download/:repository/*path",
            get(crate::handlers::files::download_file),
        )
        .route("/list", get(crate::handlers::files::list_repositories))
        .route(
            "/list/:repository",
            get(crate::handlers::files::list_entries),
        )
        // Deletion.
        .route(
            "/delete/:repository/*path",
            delete(crate::handlers::files::delete_file),
        )
        // Application state shared across all handlers.
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(TraceLayer::new_for_http())
        // common_headers_middleware adds standard response headers.
        .layer(middleware::from_fn(common_headers_middleware))
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        // The streaming size limit is enforced per-upload by the blob
        // store, not by axum's default 2MB body cap.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Tower middleware that adds common response headers to every response:
/// - `x-ingot-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `Ingot`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Only set x-ingot-request-id if not already present (error handler
    // may set it).
    if !headers.contains_key("x-ingot-request-id") {
        let request_id = generate_request_id();
        headers.insert(
            "x-ingot-request-id",
            HeaderValue::from_str(&request_id).unwrap(),
        );
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    headers.insert("date", HeaderValue::from_str(&date).unwrap());
    headers.insert("server", HeaderValue::from_static("Ingot"));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- the machine-readable API description.
async fn openapi_spec() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    use crate::blobstore::BlobStore;
    use crate::config::Config;
    use crate::index::memory::MemoryNamespaceIndex;
    use crate::upload::UploadService;

    fn test_app(max_upload_size: u64) -> (tempfile::TempDir, Router) {
        crate::metrics::init_metrics();
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let blobs = Arc::new(BlobStore::open(dir.path(), true).expect("failed to open store"));
        let index = Arc::new(MemoryNamespaceIndex::new());
        let service = UploadService::new(blobs, index, max_upload_size);
        let state = Arc::new(crate::AppState {
            config: Config::default(),
            service,
        });
        (dir, app(state))
    }

    const BOUNDARY: &str = "IngotTestBoundary";

    /// Build a multipart/form-data body with a single `file` field.
    fn multipart_body(filename: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(uri: &str, filename: &str, data: &[u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(filename, data)))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, app) = test_app(1024);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["server"], "Ingot");
        assert!(response.headers().contains_key("x-ingot-request-id"));
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let (_dir, app) = test_app(1024 * 1024);

        let response = app
            .clone()
            .oneshot(upload_request("/upload/docs/reports", "q3.txt", b"Hello, World!"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["repository"], "docs");
        assert_eq!(body["path"], "reports/q3.txt");
        assert_eq!(body["filename"], "q3.txt");
        assert_eq!(body["size"], 13);
        let hash = body["hash"].as_str().unwrap().to_string();
        assert_eq!(hash.len(), 64);

        let response = app
            .oneshot(
                Request::get("/download/docs/reports/q3.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["etag"], format!("\"{hash}\""));
        assert_eq!(response.headers()["content-length"], "13");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"Hello, World!");
    }

    #[tokio::test]
    async fn test_upload_to_repository_root() {
        let (_dir, app) = test_app(1024);

        let response = app
            .clone()
            .oneshot(upload_request("/upload/docs", "readme.md", b"hi"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["path"], "readme.md");

        let response = app
            .oneshot(
                Request::get("/download/docs/readme.md")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_download_missing_entry_is_404() {
        let (_dir, app) = test_app(1024);

        let response = app
            .oneshot(
                Request::get("/download/docs/absent.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "NotFound");
    }

    #[tokio::test]
    async fn test_traversal_filename_is_rejected() {
        let (_dir, app) = test_app(1024);

        let response = app
            .oneshot(upload_request("/upload/docs", "../evil.txt", b"nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "InvalidName");
    }

    #[tokio::test]
    async fn test_upload_over_limit_is_413() {
        let (_dir, app) = test_app(8);

        let response = app
            .clone()
            .oneshot(upload_request("/upload/docs", "big.bin", b"way past eight bytes"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // Nothing was published.
        let response = app
            .oneshot(
                Request::get("/download/docs/big.bin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_file_field_is_400() {
        let (_dir, app) = test_app(1024);

        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"other\"\r\n\r\n");
        body.extend_from_slice(b"data");
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let response = app
            .oneshot(
                Request::post("/upload/docs")
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={BOUNDARY}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_repository_with_prefix() {
        let (_dir, app) = test_app(1024);

        for (uri, filename) in [
            ("/upload/docs/reports", "q3.txt"),
            ("/upload/docs/reports", "q4.txt"),
            ("/upload/docs", "notes.md"),
        ] {
            let response = app
                .clone()
                .oneshot(upload_request(uri, filename, b"data"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(
                Request::get("/list/docs?prefix=reports/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let entries = body["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["path"], "reports/q3.txt");
        assert_eq!(entries[1]["path"], "reports/q4.txt");

        let response = app
            .oneshot(Request::get("/list/docs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_repositories() {
        let (_dir, app) = test_app(1024);

        for repo in ["alpha", "beta", "alpha"] {
            let uri = format!("/upload/{repo}");
            let response = app
                .clone()
                .oneshot(upload_request(&uri, "file.txt", repo.as_bytes()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        // Same name twice in alpha overwrites, so counts stay at one each.

        let response = app
            .clone()
            .oneshot(upload_request("/upload/alpha", "second.txt", b"x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/list").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let repos = body["repositories"].as_array().unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0]["name"], "alpha");
        assert_eq!(repos[0]["entries"], 2);
        assert_eq!(repos[1]["name"], "beta");
        assert_eq!(repos[1]["entries"], 1);
    }

    #[tokio::test]
    async fn test_delete_then_download_is_404() {
        let (_dir, app) = test_app(1024);

        let response = app
            .clone()
            .oneshot(upload_request("/upload/docs", "gone.txt", b"bye"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::delete("/delete/docs/gone.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(
                Request::get("/download/docs/gone.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Deleting again is also 404.
        let response = app
            .oneshot(
                Request::delete("/delete/docs/gone.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_observability_endpoints_can_be_disabled() {
        crate::metrics::init_metrics();
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(BlobStore::open(dir.path(), true).unwrap());
        let index = Arc::new(MemoryNamespaceIndex::new());
        let service = UploadService::new(blobs, index, 1024);
        let mut config = Config::default();
        config.observability.health_check = false;
        config.observability.metrics = false;
        let state = Arc::new(crate::AppState { config, service });
        let app = app(state);

        for uri in ["/health", "/metrics"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }

        // The storage API itself is unaffected.
        let response = app
            .oneshot(upload_request("/upload/docs", "still-on.txt", b"x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_enabled_by_default() {
        let (_dir, app) = test_app(1024);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_openapi_spec_is_served() {
        let (_dir, app) = test_app(1024);

        let response = app
            .oneshot(Request::get("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["info"]["title"], "Ingot");
        assert!(body["paths"]["/upload/{repository}"].is_object());
    }
}
