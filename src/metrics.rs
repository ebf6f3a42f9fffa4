//! Prometheus metrics for Hatrac.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "hatrac_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "hatrac_http_request_duration_seconds";

/// Total directory/storage operations (counter). Labels: operation, status.
pub const OPERATIONS_TOTAL: &str = "hatrac_operations_total";

/// Total namespaces known to the directory (gauge).
pub const NAMESPACES_TOTAL: &str = "hatrac_namespaces_total";

/// Total objects known to the directory (gauge).
pub const OBJECTS_TOTAL: &str = "hatrac_objects_total";

/// Total bytes received in request bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "hatrac_bytes_received_total";

/// Total bytes sent in response bodies (counter).
pub const BYTES_SENT_TOTAL: &str = "hatrac_bytes_sent_total";

/// HTTP request body size in bytes (histogram). Labels: method, path.
pub const HTTP_REQUEST_SIZE_BYTES: &str = "hatrac_http_request_size_bytes";

/// HTTP response body size in bytes (histogram). Labels: method, path.
pub const HTTP_RESPONSE_SIZE_BYTES: &str = "hatrac_http_response_size_bytes";

/// Histogram bucket boundaries for body size metrics (bytes).
pub const SIZE_HISTOGRAM_BUCKETS: [f64; 10] = [
    256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0, 16777216.0, 67108864.0,
];

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
    describe_counter!(OPERATIONS_TOTAL, "Total Hatrac operations by type");
    describe_gauge!(NAMESPACES_TOTAL, "Total namespaces in the directory");
    describe_gauge!(OBJECTS_TOTAL, "Total objects in the directory");
    describe_counter!(
        BYTES_RECEIVED_TOTAL,
        "Total bytes received (request bodies)"
    );
    describe_counter!(BYTES_SENT_TOTAL, "Total bytes sent (response bodies)");
    describe_histogram!(HTTP_REQUEST_SIZE_BYTES, "HTTP request body size in bytes");
    describe_histogram!(HTTP_RESPONSE_SIZE_BYTES, "HTTP response body size in bytes");

    // Seed all metrics so they appear in /metrics output immediately,
    // even before any requests have been processed.
    // Note: counters must be incremented with a non-zero value to appear in
    // Prometheus output; gauges appear with set(0.0) because that is an
    // explicit value assignment.
    counter!(OPERATIONS_TOTAL, "operation" => "seed", "status" => "success").absolute(0);
    gauge!(NAMESPACES_TOTAL).set(0.0);
    gauge!(OBJECTS_TOTAL).set(0.0);
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
    let raw_path = req.uri().path().to_string();
    let path = normalize_path(&raw_path);

    // Do not instrument the metrics endpoint itself.
    if raw_path == "/metrics" {
        return next.run(req).await;
    }

    // Capture request body size by consuming and reconstructing the body.
    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let req_size = body_bytes.len() as f64;
    let req = Request::from_parts(parts, axum::body::Body::from(body_bytes));

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    // Capture response body size by consuming and reconstructing the response.
    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = axum::body::to_bytes(resp_body, usize::MAX)
        .await
        .unwrap_or_default();
    let resp_size = resp_bytes.len() as f64;
    let response = Response::from_parts(resp_parts, axum::body::Body::from(resp_bytes));

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status.clone()).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method.clone(), "path" => path.clone())
        .record(duration);
    histogram!(HTTP_REQUEST_SIZE_BYTES, "method" => method.clone(), "path" => path.clone())
        .record(req_size);
    histogram!(HTTP_RESPONSE_SIZE_BYTES, "method" => method.clone(), "path" => path.clone())
        .record(resp_size);
    counter!(BYTES_RECEIVED_TOTAL).increment(req_size as u64);
    counter!(BYTES_SENT_TOTAL).increment(resp_size as u64);

    if let Some(operation) = map_hatrac_operation(&method, &raw_path) {
        let op_status = if response.status().is_success() {
            "success"
        } else {
            "error"
        };
        counter!(OPERATIONS_TOTAL, "operation" => operation, "status" => op_status.to_string())
            .increment(1);
    }

    response
}

// -- Operation mapping --------------------------------------------------------

/// Map an HTTP method + raw request path to a Hatrac operation name, per the
/// subresource grammar of §6 (`;acl`, `;metadata`, `;versions`, `;upload`).
/// Returns `None` for non-Hatrac endpoints (health, metrics, etc).
fn map_hatrac_operation(method: &str, path: &str) -> Option<String> {
    if path == "/" || path == "/health" || path == "/healthz" || path == "/readyz" || path == "/metrics" {
        return None;
    }

    let last_segment = path.rsplit('/').next().unwrap_or("");
    let subresource = last_segment.split_once(';').map(|(_, rest)| rest);

    match subresource {
        Some(rest) if rest == "acl" || rest.starts_with("acl/") => match method {
            "GET" => Some("GetAcl".to_string()),
            "PUT" => Some("PutAcl".to_string()),
            "DELETE" => Some("DeleteAcl".to_string()),
            _ => None,
        },
        Some(rest) if rest == "metadata" || rest.starts_with("metadata/") => match method {
            "GET" => Some("GetMetadata".to_string()),
            "PUT" => Some("PutMetadata".to_string()),
            "DELETE" => Some("DeleteMetadata".to_string()),
            _ => None,
        },
        Some("versions") => match method {
            "GET" => Some("ListVersions".to_string()),
            _ => None,
        },
        Some(rest) if rest == "upload" || rest.starts_with("upload/") => match method {
            "POST" if rest == "upload" => Some("CreateUpload".to_string()),
            "PUT" => Some("UploadChunk".to_string()),
            "POST" => Some("FinalizeUpload".to_string()),
            "DELETE" => Some("CancelUpload".to_string()),
            "GET" => Some("GetUploadStatus".to_string()),
            _ => None,
        },
        Some(_) => None,
        None => {
            // Object-version-or-namespace path with no `;subresource`.
            let has_version_tag = last_segment.contains(':');
            match method {
                "GET" | "HEAD" => {
                    if has_version_tag {
                        Some("GetObjectVersion".to_string())
                    } else {
                        Some("GetObject".to_string())
                    }
                }
                "PUT" => Some("PutVersion".to_string()),
                "POST" => Some("CreateName".to_string()),
                "DELETE" => Some("DeleteName".to_string()),
                _ => None,
            }
        }
    }
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a low-cardinality route template for
/// metric labels, preserving the `;subresource` suffix but collapsing the
/// resource path and any explicit `:tag` down to placeholders.
///
/// Examples:
/// - `/healthz` -> `/healthz`
/// - `/p/my/object` -> `/p/{path}`
/// - `/p/my/object:abc123` -> `/p/{path}:{tag}`
/// - `/p/my/object;acl/read` -> `/p/{path};acl/{role}`
/// - `/p/my/object;metadata/content-type` -> `/p/{path};metadata/{field}`
/// - `/p/my/object;versions` -> `/p/{path};versions`
/// - `/p/my/object;upload/job123/4` -> `/p/{path};upload/{job}/{position}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/healthz" | "/readyz" | "/metrics" => return path.to_string(),
        _ => {}
    }

    let last_segment = path.rsplit('/').next().unwrap_or("");
    let Some((_, rest)) = last_segment.split_once(';') else {
        let template = if last_segment.contains(':') {
            "/p/{path}:{tag}"
        } else {
            "/p/{path}"
        };
        return template.to_string();
    };

    if rest == "versions" {
        return "/p/{path};versions".to_string();
    }
    if let Some(field) = rest.strip_prefix("metadata/") {
        let _ = field;
        return "/p/{path};metadata/{field}".to_string();
    }
    if rest == "metadata" {
        return "/p/{path};metadata".to_string();
    }
    if let Some(after) = rest.strip_prefix("acl/") {
        return if after.contains('/') {
            "/p/{path};acl/{access}/{role}".to_string()
        } else {
            "/p/{path};acl/{access}".to_string()
        };
    }
    if rest == "acl" {
        return "/p/{path};acl".to_string();
    }
    if let Some(after) = rest.strip_prefix("upload/") {
        return if after.contains('/') {
            "/p/{path};upload/{job}/{position}".to_string()
        } else {
            "/p/{path};upload/{job}".to_string()
        };
    }
    if rest == "upload" {
        return "/p/{path};upload".to_string();
    }
    "/p/{path};{subresource}".to_string()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_root_and_probes() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/healthz"), "/healthz");
        assert_eq!(normalize_path("/readyz"), "/readyz");
    }

    #[test]
    fn test_normalize_path_plain_resource() {
        assert_eq!(normalize_path("/p/my/object"), "/p/{path}");
    }

    #[test]
    fn test_normalize_path_version_tag() {
        assert_eq!(normalize_path("/p/my/object:abc123"), "/p/{path}:{tag}");
    }

    #[test]
    fn test_normalize_path_acl() {
        assert_eq!(normalize_path("/p/my/object;acl"), "/p/{path};acl");
        assert_eq!(normalize_path("/p/my/object;acl/read"), "/p/{path};acl/{access}");
        assert_eq!(
            normalize_path("/p/my/object;acl/read/alice"),
            "/p/{path};acl/{access}/{role}"
        );
    }

    #[test]
    fn test_normalize_path_metadata() {
        assert_eq!(normalize_path("/p/my/object;metadata"), "/p/{path};metadata");
        assert_eq!(
            normalize_path("/p/my/object;metadata/content-type"),
            "/p/{path};metadata/{field}"
        );
    }

    #[test]
    fn test_normalize_path_versions_and_upload() {
        assert_eq!(normalize_path("/p/my/object;versions"), "/p/{path};versions");
        assert_eq!(normalize_path("/p/my/object;upload"), "/p/{path};upload");
        assert_eq!(
            normalize_path("/p/my/object;upload/job1"),
            "/p/{path};upload/{job}"
        );
        assert_eq!(
            normalize_path("/p/my/object;upload/job1/4"),
            "/p/{path};upload/{job}/{position}"
        );
    }

    #[test]
    fn test_metric_constants_exist() {
        assert_eq!(HTTP_REQUESTS_TOTAL, "hatrac_http_requests_total");
        assert_eq!(
            HTTP_REQUEST_DURATION_SECONDS,
            "hatrac_http_request_duration_seconds"
        );
        assert_eq!(OPERATIONS_TOTAL, "hatrac_operations_total");
        assert_eq!(NAMESPACES_TOTAL, "hatrac_namespaces_total");
        assert_eq!(OBJECTS_TOTAL, "hatrac_objects_total");
        assert_eq!(BYTES_RECEIVED_TOTAL, "hatrac_bytes_received_total");
        assert_eq!(BYTES_SENT_TOTAL, "hatrac_bytes_sent_total");
        assert_eq!(HTTP_REQUEST_SIZE_BYTES, "hatrac_http_request_size_bytes");
        assert_eq!(HTTP_RESPONSE_SIZE_BYTES, "hatrac_http_response_size_bytes");
    }

    #[test]
    fn test_map_hatrac_operation_plain_resource() {
        assert_eq!(
            map_hatrac_operation("GET", "/p/my/object"),
            Some("GetObject".to_string())
        );
        assert_eq!(
            map_hatrac_operation("GET", "/p/my/object:abc123"),
            Some("GetObjectVersion".to_string())
        );
        assert_eq!(
            map_hatrac_operation("PUT", "/p/my/object"),
            Some("PutVersion".to_string())
        );
        assert_eq!(
            map_hatrac_operation("DELETE", "/p/my/object"),
            Some("DeleteName".to_string())
        );
    }

    #[test]
    fn test_map_hatrac_operation_subresources() {
        assert_eq!(
            map_hatrac_operation("GET", "/p/my/object;acl"),
            Some("GetAcl".to_string())
        );
        assert_eq!(
            map_hatrac_operation("PUT", "/p/my/object;acl/read/alice"),
            Some("PutAcl".to_string())
        );
        assert_eq!(
            map_hatrac_operation("DELETE", "/p/my/object;metadata/content-type"),
            Some("DeleteMetadata".to_string())
        );
        assert_eq!(
            map_hatrac_operation("GET", "/p/my/object;versions"),
            Some("ListVersions".to_string())
        );
        assert_eq!(
            map_hatrac_operation("POST", "/p/my/object;upload"),
            Some("CreateUpload".to_string())
        );
        assert_eq!(
            map_hatrac_operation("PUT", "/p/my/object;upload/job1/2"),
            Some("UploadChunk".to_string())
        );
    }

    #[test]
    fn test_map_hatrac_operation_non_hatrac() {
        assert_eq!(map_hatrac_operation("GET", "/healthz"), None);
        assert_eq!(map_hatrac_operation("GET", "/metrics"), None);
    }

    #[test]
    fn test_size_histogram_buckets() {
        assert_eq!(SIZE_HISTOGRAM_BUCKETS.len(), 10);
        assert_eq!(SIZE_HISTOGRAM_BUCKETS[0], 256.0);
        assert_eq!(SIZE_HISTOGRAM_BUCKETS[9], 67108864.0);
        for i in 1..SIZE_HISTOGRAM_BUCKETS.len() {
            assert!(SIZE_HISTOGRAM_BUCKETS[i] > SIZE_HISTOGRAM_BUCKETS[i - 1]);
        }
    }
}
