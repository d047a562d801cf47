//! # API Error Types
//!
//! Structured error type implementing `axum::response::IntoResponse`.
//! Maps [`CacheError`] and [`CodecError`] from artcache-core to HTTP status
//! codes and returns a JSON error body with a code and message.

use artcache_core::{CacheError, CodecError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// Inner error detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "NOT_FOUND", "NOT_ACCEPTABLE").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Application-level error type that implements [`IntoResponse`] for Axum.
#[derive(Error, Debug)]
pub enum AppError {
    /// No artifact under the key (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Put body undecodable or failed verification (406).
    #[error("not acceptable: {0}")]
    NotAcceptable(String),

    /// Missing or unknown authorization token (401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Admission control refused the transfer (429).
    #[error("too many requests: {0}")]
    TooManyRequests(String),

    /// Storage unreachable; clients retry with backoff (503).
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    /// Return the HTTP status code and machine-readable error code for this error.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::NotAcceptable(_) => (StatusCode::NOT_ACCEPTABLE, "NOT_ACCEPTABLE"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::TooManyRequests(_) => (StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if let Self::Unavailable(_) = &self {
            tracing::warn!(error = %self, "store unavailable");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound => Self::NotFound("artifact not found".to_string()),
            CacheError::InvalidRequest(msg) => Self::NotAcceptable(msg),
            CacheError::Rejected(msg) => Self::TooManyRequests(msg),
            CacheError::Unavailable(msg) => Self::Unavailable(msg),
        }
    }
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        Self::NotAcceptable(err.to_string())
    }
}
