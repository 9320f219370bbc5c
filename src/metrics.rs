//! Prometheus metrics for Ingot.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "ingot_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "ingot_http_request_duration_seconds";

/// Total bytes committed to the blob store through uploads (counter).
pub const UPLOAD_BYTES_TOTAL: &str = "ingot_upload_bytes_total";

/// Total bytes served by the download endpoint (counter).
pub const DOWNLOAD_BYTES_TOTAL: &str = "ingot_download_bytes_total";

/// Blob files removed after their last reference was dropped (counter).
pub const BLOBS_COLLECTED_TOTAL: &str = "ingot_blobs_collected_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(UPLOAD_BYTES_TOTAL, "Total bytes committed through uploads");
    describe_counter!(DOWNLOAD_BYTES_TOTAL, "Total bytes served by downloads");
    describe_counter!(
        BLOBS_COLLECTED_TOTAL,
        "Blob files removed after their last reference was dropped"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    // Do not instrument the metrics endpoint itself.
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// This prevents high-cardinality labels from unique repository and entry
/// names.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/list` -> `/list`
/// - `/upload/docs` -> `/upload/{repository}`
/// - `/upload/docs/reports` -> `/upload/{repository}/{path}`
/// - `/download/docs/reports/q3.pdf` -> `/download/{repository}/{path}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/metrics" | "/openapi.json" | "/list" => path.to_string(),
        _ => {
            let mut segments = path.trim_start_matches('/').splitn(3, '/');
            let verb = match segments.next() {
                Some(v) if !v.is_empty() => v,
                _ => return "/".to_string(),
            };
            match (segments.next(), segments.next()) {
                (Some(_), Some(_)) => format!("/{verb}/{{repository}}/{{path}}"),
                (Some(_), None) => format!("/{verb}/{{repository}}"),
                _ => format!("/{verb}"),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = PROMETHEUS_HANDLE
        .get()
        .expect("Prometheus recorder not initialized");
    let body = handle.render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
