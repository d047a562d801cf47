//! # Authorization Middleware
//!
//! Clients send a shared secret in the `Authorization` header. The header
//! value must equal one entry of the configured allow-list exactly; there
//! is no scheme prefix to strip. An empty allow-list disables the check.
//!
//! Comparison is constant-time per entry and every entry is compared, so
//! response timing does not reveal which token (or how much of one) matched.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::error::AppError;

/// Allow-list of accepted `Authorization` header values.
#[derive(Clone, Default)]
pub struct AuthConfig {
    tokens: Arc<Vec<String>>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("tokens", &format_args!("[{} REDACTED]", self.tokens.len()))
            .finish()
    }
}

impl AuthConfig {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: Arc::new(tokens.into_iter().filter(|t| !t.is_empty()).collect()),
        }
    }

    /// Whether requests are checked at all.
    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Whether `provided` equals any allowed token.
    pub fn permits(&self, provided: &str) -> bool {
        self.tokens
            .iter()
            .fold(false, |matched, token| matched | constant_time_token_eq(provided, token))
    }
}

/// Constant-time comparison of tokens.
///
/// When lengths differ, performs a dummy comparison so timing does not
/// depend on whether the lengths matched.
fn constant_time_token_eq(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        let _ = expected.ct_eq(expected);
        return false;
    }
    provided.ct_eq(expected).into()
}

/// Reject requests whose `Authorization` header is not on the allow-list.
pub async fn auth_middleware(request: Request, next: Next) -> Response {
    let config = request.extensions().get::<AuthConfig>().cloned();

    match config {
        Some(config) if config.is_enabled() => {
            let permitted = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|value| config.permits(value));

            match permitted {
                Some(true) => next.run(request).await,
                Some(false) => {
                    tracing::warn!(path = %request.uri().path(), "authorization failed: unknown token");
                    AppError::Unauthorized("invalid authorization token".into()).into_response()
                }
                None => {
                    tracing::warn!(path = %request.uri().path(), "authorization failed: missing header");
                    AppError::Unauthorized("missing authorization header".into()).into_response()
                }
            }
        }
        _ => next.run(request).await,
    }
}
