//! # Cache Service
//!
//! The get/put facade the HTTP layer calls. Owns the store handle and the
//! two admission limiters, and is the only place that turns store-level
//! outcomes into [`CacheError`]s.
//!
//! ```text
//! put: Received ─► Admitted ─► StoreOk | StoreFail ─► Responded
//! get: Received ─► Resolved | NotFound ─► Admitted ─► Responded
//! ```
//!
//! Egress admission is charged only on a hit. A put is verified and the
//! backend probed before any ingress budget is spent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::RngCore;

use crate::admission::AdmissionLimiter;
use crate::backend::HealthStatus;
use crate::codec::PutRequest;
use crate::error::{CacheError, StoreError};
use crate::id::ArtifactId;
use crate::metrics::{self, CacheTags};
use crate::store::{ArtifactStore, StoredArtifact, Summary};

/// Size of the download-speed probe artifact.
pub const DUMMY_ARTIFACT_BYTES: usize = 100_000;

/// Per-put options taken from request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Time to live; `None` keeps the artifact until evicted.
    pub ttl: Option<Duration>,
    /// Normalised client tags for metrics.
    pub tags: CacheTags,
}

/// Lifecycle of a single request, traced at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Resolved,
    NotFound,
    Admitted,
    StoreOk,
    StoreFail,
    Responded,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Resolved => "resolved",
            Self::NotFound => "not_found",
            Self::Admitted => "admitted",
            Self::StoreOk => "store_ok",
            Self::StoreFail => "store_fail",
            Self::Responded => "responded",
        }
    }
}

fn phase(op: &'static str, phase: RequestPhase) {
    tracing::trace!(op, phase = phase.as_str(), "request phase");
}

/// Get/put orchestration over an [`ArtifactStore`].
#[derive(Debug)]
pub struct CacheService {
    store: Arc<ArtifactStore>,
    ingress: AdmissionLimiter,
    egress: AdmissionLimiter,
}

impl CacheService {
    pub fn new(store: Arc<ArtifactStore>, ingress: AdmissionLimiter, egress: AdmissionLimiter) -> Self {
        tracing::info!(
            ingress_limited = ingress.is_limited(),
            ingress_policy = %ingress.policy(),
            egress_limited = egress.is_limited(),
            egress_policy = %egress.policy(),
            "cache service configured"
        );
        Self {
            store,
            ingress,
            egress,
        }
    }

    /// A service with no admission limits.
    pub fn unlimited(store: Arc<ArtifactStore>) -> Self {
        Self::new(
            store,
            AdmissionLimiter::unlimited("ingress"),
            AdmissionLimiter::unlimited("egress"),
        )
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn ingress(&self) -> &AdmissionLimiter {
        &self.ingress
    }

    pub fn egress(&self) -> &AdmissionLimiter {
        &self.egress
    }

    /// Store a decoded put request.
    pub async fn put(&self, request: PutRequest, options: PutOptions) -> Result<ArtifactId, CacheError> {
        let started = Instant::now();
        let tags = options.tags.clone();
        metrics::count(metrics::PUT_CALL_COUNT, 1, &tags);

        let result = self.put_inner(request, options).await;

        metrics::record(
            metrics::PUT_CALL_TIME,
            started.elapsed().as_secs_f64() * 1000.0,
            &tags,
        );
        match &result {
            Ok(_) => {}
            Err(CacheError::InvalidRequest(_) | CacheError::Rejected(_)) => {
                metrics::count(metrics::PUT_REJECTED_COUNT, 1, &tags);
            }
            Err(_) => metrics::count(metrics::PUT_ERROR_COUNT, 1, &tags),
        }
        phase("put", RequestPhase::Responded);
        result
    }

    async fn put_inner(&self, request: PutRequest, options: PutOptions) -> Result<ArtifactId, CacheError> {
        phase("put", RequestPhase::Received);
        if !request.verify() {
            tracing::debug!(keys = request.keys.len(), size = request.payload.len(), "put failed verification");
            return Err(CacheError::InvalidRequest(
                "put needs at least one key and a non-empty payload".to_string(),
            ));
        }
        if let HealthStatus::Unhealthy(reason) = self.store.health() {
            return Err(CacheError::Unavailable(reason));
        }

        self.ingress.checkout(request.consumed).await?;
        phase("put", RequestPhase::Admitted);
        metrics::count(metrics::INCOMING_BYTES_TOTAL_COUNT, request.consumed, &options.tags);
        metrics::record(
            metrics::INCOMING_BYTES_PER_REQUEST,
            request.consumed as f64,
            &options.tags,
        );

        let key_count = request.keys.len();
        match self
            .store
            .put(&request.keys, request.payload, options.ttl, options.tags)
        {
            Ok(id) => {
                phase("put", RequestPhase::StoreOk);
                tracing::debug!(id = %id, keys = key_count, "stored artifact");
                Ok(id)
            }
            Err(err) => {
                phase("put", RequestPhase::StoreFail);
                tracing::warn!(error = %err, keys = key_count, "put failed");
                Err(self.surface(err))
            }
        }
    }

    /// Fetch the artifact stored under `key`.
    pub async fn get(&self, key: &str, tags: &CacheTags) -> Result<StoredArtifact, CacheError> {
        let started = Instant::now();
        metrics::count(metrics::GET_CALL_COUNT, 1, tags);

        let result = self.get_inner(key, tags).await;

        metrics::record(
            metrics::GET_CALL_TIME,
            started.elapsed().as_secs_f64() * 1000.0,
            tags,
        );
        if matches!(result, Err(CacheError::Unavailable(_) | CacheError::Rejected(_))) {
            metrics::count(metrics::GET_ERROR_COUNT, 1, tags);
        }
        phase("get", RequestPhase::Responded);
        result
    }

    async fn get_inner(&self, key: &str, tags: &CacheTags) -> Result<StoredArtifact, CacheError> {
        phase("get", RequestPhase::Received);
        let artifact = match self.store.get(key) {
            Ok(artifact) => artifact,
            Err(err) => {
                let err = self.surface(err);
                if err == CacheError::NotFound {
                    phase("get", RequestPhase::NotFound);
                    metrics::count(metrics::CACHE_MISS_COUNT, 1, tags);
                }
                return Err(err);
            }
        };
        phase("get", RequestPhase::Resolved);
        metrics::count(metrics::CACHE_HIT_COUNT, 1, tags);

        self.egress.checkout(artifact.size).await?;
        phase("get", RequestPhase::Admitted);
        metrics::count(metrics::OUTGOING_BYTES_TOTAL_COUNT, artifact.size, tags);
        metrics::record(metrics::OUTGOING_BYTES_PER_REQUEST, artifact.size as f64, tags);
        Ok(artifact)
    }

    /// Map a store error to the outward taxonomy. Consistency violations
    /// are logged and counted here, then reported as misses.
    fn surface(&self, err: StoreError) -> CacheError {
        match err {
            StoreError::NotFound => CacheError::NotFound,
            StoreError::Unavailable(reason) => CacheError::Unavailable(reason),
            StoreError::ConsistencyViolation { key, id } => {
                tracing::error!(key = %key, id = %id, "key resolves to an artifact with no live blob");
                ::metrics::counter!(metrics::CONSISTENCY_VIOLATION_COUNT).increment(1);
                CacheError::NotFound
            }
        }
    }

    /// Key and artifact counts. Fails when the backend is unhealthy.
    pub fn summary(&self) -> Result<Summary, CacheError> {
        ::metrics::counter!(metrics::SUMMARY_CALL_COUNT).increment(1);
        match self.store.health() {
            HealthStatus::Healthy => Ok(self.store.summary()),
            HealthStatus::Unhealthy(reason) => {
                ::metrics::counter!(metrics::SUMMARY_ERROR_COUNT).increment(1);
                tracing::warn!(reason = %reason, "summary requested while backend unhealthy");
                Err(CacheError::Unavailable(reason))
            }
        }
    }

    pub fn health(&self) -> HealthStatus {
        self.store.health()
    }

    /// Random bytes for clients measuring download speed. Never stored.
    pub fn dummy_artifact(&self) -> Bytes {
        let mut payload = vec![0u8; DUMMY_ARTIFACT_BYTES];
        rand::thread_rng().fill_bytes(&mut payload);
        Bytes::from(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionPolicy, ByteRate};
    use crate::backend::{Blob, BlobBackend, MemoryBackend, ReclamationEvent, ReclamationKind, ReclamationStream};
    use crate::codec::{decode_put, encode_put};
    use crate::error::BackendError;
    use crate::reconciler::EvictionReconciler;

    fn request(keys: &[&str], payload: &[u8]) -> PutRequest {
        decode_put(Bytes::from(encode_put(keys, payload).unwrap())).unwrap()
    }

    fn service() -> CacheService {
        let backend = Arc::new(MemoryBackend::new(1 << 24));
        CacheService::unlimited(Arc::new(ArtifactStore::new(backend)))
    }

    /// A backend that reports itself unhealthy and fails every call.
    struct DownBackend;

    impl BlobBackend for DownBackend {
        fn insert(&self, _: ArtifactId, _: Blob) -> Result<(), BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        fn get(&self, _: ArtifactId) -> Result<Option<Bytes>, BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        fn contains(&self, _: ArtifactId) -> Result<bool, BackendError> {
            Err(BackendError::Unavailable("down".into()))
        }
        fn discard(&self, _: ArtifactId) -> Result<(), BackendError> {
            Ok(())
        }
        fn health(&self) -> HealthStatus {
            HealthStatus::Unhealthy("down".into())
        }
        fn subscribe(&self) -> Option<ReclamationStream> {
            None
        }
    }

    #[tokio::test]
    async fn put_then_get_by_every_key() {
        let service = service();
        let id = service
            .put(request(&["k1", "k2"], b"payload"), PutOptions::default())
            .await
            .unwrap();

        for key in ["k1", "k2"] {
            let hit = service.get(key, &CacheTags::none()).await.unwrap();
            assert_eq!(hit.id, id);
            assert_eq!(hit.payload, Bytes::from_static(b"payload"));
        }
        assert_eq!(service.summary().unwrap(), Summary { keys: 2, artifacts: 1 });
    }

    #[tokio::test]
    async fn expired_artifact_becomes_a_miss() {
        let service = service();
        let payload = vec![0xABu8; 100 * 1024];
        let id = service
            .put(
                request(&["k1", "k2"], &payload),
                PutOptions {
                    ttl: Some(Duration::from_secs(60)),
                    tags: CacheTags::parse(Some("ci")),
                },
            )
            .await
            .unwrap();

        let hit = service.get("k1", &CacheTags::none()).await.unwrap();
        assert_eq!(hit.size, payload.len() as u64);

        EvictionReconciler::new(Arc::clone(service.store())).handle(ReclamationEvent {
            id,
            kind: ReclamationKind::Expired,
        });

        assert_eq!(service.get("k1", &CacheTags::none()).await, Err(CacheError::NotFound));
        assert_eq!(service.get("k2", &CacheTags::none()).await, Err(CacheError::NotFound));
        assert_eq!(service.summary().unwrap(), Summary { keys: 0, artifacts: 0 });
    }

    #[tokio::test]
    async fn unverifiable_put_is_invalid() {
        let service = service();
        assert!(matches!(
            service.put(request(&[], b"data"), PutOptions::default()).await,
            Err(CacheError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.put(request(&["k"], b""), PutOptions::default()).await,
            Err(CacheError::InvalidRequest(_))
        ));
        assert_eq!(service.summary().unwrap().artifacts, 0);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        assert_eq!(
            service().get("nope", &CacheTags::none()).await,
            Err(CacheError::NotFound)
        );
    }

    #[tokio::test]
    async fn unhealthy_backend_is_unavailable() {
        let service = CacheService::unlimited(Arc::new(ArtifactStore::new(Arc::new(DownBackend))));

        assert!(matches!(
            service.put(request(&["k"], b"x"), PutOptions::default()).await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(matches!(service.summary(), Err(CacheError::Unavailable(_))));
        assert!(!service.health().is_healthy());
    }

    #[tokio::test]
    async fn consistency_violation_is_reported_as_miss() {
        let backend = Arc::new(MemoryBackend::new(1 << 20));
        let store = Arc::new(ArtifactStore::new(backend.clone()));
        let service = CacheService::unlimited(Arc::clone(&store));
        let id = service
            .put(request(&["k"], b"data"), PutOptions::default())
            .await
            .unwrap();

        // Drop the blob behind the store's back, leaving the key dangling.
        backend.discard(id).unwrap();

        assert_eq!(service.get("k", &CacheTags::none()).await, Err(CacheError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn ingress_rejection_surfaces_as_rejected() {
        let store = Arc::new(ArtifactStore::new(Arc::new(MemoryBackend::new(1 << 20))));
        let service = CacheService::new(
            store,
            AdmissionLimiter::new(
                "ingress",
                ByteRate {
                    bytes_per_sec: 10,
                    burst_bytes: 10,
                },
                AdmissionPolicy::RejectImmediately,
            ),
            AdmissionLimiter::unlimited("egress"),
        );

        // The first oversized put is admitted against a full bucket.
        service
            .put(request(&["a"], &[1u8; 100]), PutOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            service.put(request(&["b"], &[1u8; 100]), PutOptions::default()).await,
            Err(CacheError::Rejected(_))
        ));
        assert_eq!(service.get("b", &CacheTags::none()).await, Err(CacheError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn egress_is_charged_only_on_hits() {
        let store = Arc::new(ArtifactStore::new(Arc::new(MemoryBackend::new(1 << 20))));
        let service = CacheService::new(
            store,
            AdmissionLimiter::unlimited("ingress"),
            AdmissionLimiter::new(
                "egress",
                ByteRate::per_second(1000),
                AdmissionPolicy::RejectImmediately,
            ),
        );

        for _ in 0..10 {
            assert_eq!(service.get("miss", &CacheTags::none()).await, Err(CacheError::NotFound));
        }
        assert_eq!(service.egress().available_bytes(), Some(1000.0));

        service
            .put(request(&["k"], &[0u8; 600]), PutOptions::default())
            .await
            .unwrap();
        service.get("k", &CacheTags::none()).await.unwrap();
        assert!(matches!(
            service.get("k", &CacheTags::none()).await,
            Err(CacheError::Rejected(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_overwrites_always_serve_a_whole_artifact() {
        let service = Arc::new(service());
        let a = vec![b'a'; 4096];
        let b = vec![b'b'; 4096];

        let mut tasks = Vec::new();
        for i in 0..8 {
            let service = Arc::clone(&service);
            let payload = if i % 2 == 0 { a.clone() } else { b.clone() };
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    service
                        .put(request(&["shared", "other"], &payload), PutOptions::default())
                        .await
                        .unwrap();
                    if let Ok(hit) = service.get("shared", &CacheTags::none()).await {
                        assert!(hit.payload.iter().all(|&x| x == hit.payload[0]));
                        assert_eq!(hit.size, 4096);
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(service.store().check_consistency().is_empty());
        assert_eq!(service.summary().unwrap(), Summary { keys: 2, artifacts: 1 });
    }

    #[test]
    fn dummy_artifact_is_random_and_sized() {
        let service = service();
        let first = service.dummy_artifact();
        let second = service.dummy_artifact();
        assert_eq!(first.len(), DUMMY_ARTIFACT_BYTES);
        assert_ne!(first, second);
    }
}
