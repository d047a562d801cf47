//! Health probe and metrics scrape endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(scrape))
}

/// 200 `OK` while the backend is healthy, 500 `NOT OK` otherwise.
async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let status = state.service.health();
    if status.is_healthy() {
        (StatusCode::OK, "OK")
    } else {
        tracing::warn!(status = ?status, "health probe failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "NOT OK")
    }
}

async fn scrape(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => AppError::NotFound("metrics exporter not installed".into()).into_response(),
    }
}
