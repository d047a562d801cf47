//! # artcache-core: Keyed Artifact Store for the Build Cache
//!
//! Clients store opaque build outputs under one or more string keys and
//! fetch them back by any of those keys. This crate owns everything below
//! the HTTP layer:
//!
//! | Module          | Responsibility                                          |
//! |-----------------|---------------------------------------------------------|
//! | [`id`]          | Underlying artifact identifiers and their sequence      |
//! | [`backend`]     | Blob storage with capacity eviction, TTL, reclamation events |
//! | [`store`]       | The four indexes: blob, metadata, forward keys, reverse keys |
//! | [`reconciler`]  | Restores index consistency when the backend reclaims a blob |
//! | [`admission`]   | Byte-rate token bucket gating ingress and egress        |
//! | [`codec`]       | Put request body / get response body encoding           |
//! | [`service`]     | Get/Put orchestration consumed by the API crate         |
//! | [`metrics`]     | Metric names and cache-tag normalisation                |
//!
//! ## Data Flow
//!
//! ```text
//! PUT bytes ─► codec::decode_put ─► ingress checkout ─► ArtifactStore::put
//! backend reclamation ─► channel ─► EvictionReconciler ─► ArtifactStore::reclaim
//! GET key ─► ArtifactStore::get ─► egress checkout ─► codec::encode_get
//! ```
//!
//! ## Crate Policy
//!
//! - No `unsafe` code.
//! - No `.unwrap()` / `.expect()` outside tests.
//! - No global state: every component is constructed explicitly and shared
//!   through `Arc`.

pub mod admission;
pub mod backend;
pub mod codec;
pub mod error;
pub mod id;
pub mod metrics;
pub mod reconciler;
pub mod service;
pub mod store;

pub use admission::{AdmissionLimiter, AdmissionPolicy, ByteRate};
pub use backend::{BlobBackend, HealthStatus, MemoryBackend, ReclamationEvent, ReclamationKind};
pub use codec::PutRequest;
pub use error::{AdmissionError, BackendError, CacheError, CodecError, StoreError};
pub use id::{ArtifactId, SequenceGenerator};
pub use crate::metrics::CacheTags;
pub use reconciler::EvictionReconciler;
pub use service::{CacheService, PutOptions};
pub use store::{ArtifactStore, StoredArtifact, Summary};
