//! # Request Metrics
//!
//! Per-request counters kept in process (for tests and diagnostics) and
//! mirrored into the `metrics` facade so the Prometheus exporter sees them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

pub const HTTP_REQUEST_COUNT: &str = "artcache.http.request.count";
pub const HTTP_ERROR_COUNT: &str = "artcache.http.error.count";

/// Shared metrics state.
#[derive(Debug, Clone)]
pub struct ApiMetrics {
    pub request_count: Arc<AtomicU64>,
    pub error_count: Arc<AtomicU64>,
}

impl ApiMetrics {
    pub fn new() -> Self {
        Self {
            request_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Requests seen so far.
    pub fn requests(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Requests answered with a 4xx or 5xx status.
    pub fn errors(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Middleware that increments request and error counters.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let metrics = request.extensions().get::<ApiMetrics>().cloned();
    let method = request.method().as_str().to_owned();

    let response = next.run(request).await;

    let status = response.status();
    ::metrics::counter!(HTTP_REQUEST_COUNT, "method" => method.clone(), "status" => status.as_u16().to_string())
        .increment(1);
    let failed = status.is_server_error() || status.is_client_error();
    if failed {
        ::metrics::counter!(HTTP_ERROR_COUNT, "method" => method, "status" => status.as_u16().to_string())
            .increment(1);
    }

    if let Some(m) = metrics {
        m.request_count.fetch_add(1, Ordering::Relaxed);
        if failed {
            m.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    response
}
