//! # Artifact Routes
//!
//! | Method | Path                      | Success                         |
//! |--------|---------------------------|---------------------------------|
//! | GET    | `/artifacts/summary`      | 200 `Storing N artifacts with M keys.` |
//! | GET    | `/artifacts/dummy`        | 200, random bytes               |
//! | GET    | `/artifacts/key/{key}`    | 200, raw payload                |
//! | PUT    | `/artifacts/key`          | 202                             |
//!
//! Put bodies use the binary layout in [`artcache_core::codec`]. Optional
//! request headers:
//!
//! - `X-Cache-Expiry-Seconds`: positive integer TTL. Anything else means
//!   no TTL.
//! - `X-Cache-Tags`: a tag attached to metrics as the `cache_tags` label.

use std::time::Duration;

use artcache_core::codec::{decode_put, encode_get};
use artcache_core::{CacheTags, PutOptions};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;

use crate::error::AppError;
use crate::state::AppState;

pub const EXPIRY_HEADER: &str = "x-cache-expiry-seconds";
pub const TAGS_HEADER: &str = "x-cache-tags";

const OCTET_STREAM: &str = "application/octet-stream";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/artifacts/summary", get(summary))
        .route("/artifacts/dummy", get(dummy))
        .route("/artifacts/key/{key}", get(get_artifact))
        .route("/artifacts/key", axum::routing::put(put_artifact))
}

/// Parse `X-Cache-Expiry-Seconds`. Malformed, zero or negative values mean no TTL.
pub fn parse_expiry(value: Option<&str>) -> Option<Duration> {
    let seconds: i64 = value?.trim().parse().ok()?;
    u64::try_from(seconds)
        .ok()
        .filter(|&s| s > 0)
        .map(Duration::from_secs)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn tags_from(headers: &HeaderMap) -> CacheTags {
    CacheTags::parse(header_str(headers, TAGS_HEADER))
}

/// Always 200; a failure is reported in the body.
async fn summary(State(state): State<AppState>) -> String {
    match state.service.summary() {
        Ok(summary) => format!(
            "Storing {} artifacts with {} keys.",
            summary.artifacts, summary.keys
        ),
        Err(err) => {
            tracing::warn!(error = %err, "summary failed");
            "I am broken".to_string()
        }
    }
}

async fn dummy(State(state): State<AppState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, OCTET_STREAM)], state.service.dummy_artifact())
}

async fn get_artifact(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let tags = tags_from(&headers);
    let artifact = state.service.get(&key, &tags).await?;
    tracing::debug!(key = %key, id = %artifact.id, size = artifact.size, "serving artifact");
    Ok(([(header::CONTENT_TYPE, OCTET_STREAM)], encode_get(&artifact)).into_response())
}

async fn put_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let request = decode_put(body).map_err(|err| {
        tracing::debug!(error = %err, "undecodable put body");
        AppError::from(err)
    })?;
    let options = PutOptions {
        ttl: parse_expiry(header_str(&headers, EXPIRY_HEADER)),
        tags: tags_from(&headers),
    };
    state.service.put(request, options).await?;
    Ok(StatusCode::ACCEPTED)
}
