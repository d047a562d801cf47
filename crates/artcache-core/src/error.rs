//! # Error Types
//!
//! One `thiserror` enum per layer. Lower layers never panic on missing or
//! duplicate cleanup targets; those are idempotent no-ops, not errors.
//! [`CacheError`] is the outward-facing taxonomy the API crate maps to
//! HTTP status codes.

use std::time::Duration;

use thiserror::Error;

use crate::id::ArtifactId;

/// Failure reported by a [`BlobBackend`](crate::backend::BlobBackend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The storage engine is unreachable or degraded.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of an [`ArtifactStore`](crate::store::ArtifactStore) operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key has no live mapping.
    #[error("no artifact stored under the requested key")]
    NotFound,

    /// The backend could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The forward index resolved to an artifact whose blob is gone.
    ///
    /// Indicates a reconciliation lag or bug. Callers treat it as a miss.
    #[error("key {key:?} resolves to artifact {id} which has no live blob")]
    ConsistencyViolation {
        /// The external key that was looked up.
        key: String,
        /// The dangling artifact id.
        id: ArtifactId,
    },
}

impl From<BackendError> for StoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => Self::Unavailable(msg),
        }
    }
}

/// Malformed put request body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The body ended before a declared field was complete.
    #[error("body truncated while reading {field}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Field being decoded.
        field: &'static str,
        /// Bytes required to finish the field.
        needed: usize,
        /// Bytes left in the body.
        available: usize,
    },

    /// The key count header was negative.
    #[error("negative key count: {0}")]
    NegativeKeyCount(i32),

    /// A key was not valid modified UTF-8.
    #[error("invalid key encoding: {0}")]
    InvalidKey(String),

    /// A key does not fit the 16-bit length prefix.
    #[error("key encodes to {0} bytes, limit is 65535")]
    KeyTooLong(usize),

    /// More keys than the 32-bit count header can express.
    #[error("too many keys: {0}")]
    TooManyKeys(usize),
}

/// Admission control refused a checkout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The bucket was short and the policy rejects instead of waiting.
    #[error("{limiter} admission rejected {requested} bytes")]
    Rejected {
        /// Which limiter refused (`ingress` / `egress`).
        limiter: &'static str,
        /// Bytes the caller asked for.
        requested: u64,
    },

    /// The caller waited for the configured limit without enough budget accruing.
    #[error("{limiter} admission of {requested} bytes timed out after {waited:?}")]
    TimedOut {
        /// Which limiter refused.
        limiter: &'static str,
        /// Bytes the caller asked for.
        requested: u64,
        /// How long the caller was suspended.
        waited: Duration,
    },
}

/// Per-request outcome surfaced by [`CacheService`](crate::service::CacheService).
///
/// No variant is fatal to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key has no live mapping (also used for consistency violations).
    #[error("artifact not found")]
    NotFound,

    /// The underlying store is unreachable; callers may retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The put request failed verification.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Admission control refused the transfer.
    #[error("admission rejected: {0}")]
    Rejected(String),
}

impl From<AdmissionError> for CacheError {
    fn from(err: AdmissionError) -> Self {
        Self::Rejected(err.to_string())
    }
}

impl From<CodecError> for CacheError {
    fn from(err: CodecError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}
