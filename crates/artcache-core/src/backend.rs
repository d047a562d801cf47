//! # Blob Backend
//!
//! The storage engine that physically holds artifact payloads. It is free
//! to reclaim entries on its own (TTL expiry, capacity eviction) and reports
//! every reclamation as a [`ReclamationEvent`] on a channel handed out once
//! by [`BlobBackend::subscribe`]. The [`EvictionReconciler`] is the only
//! intended subscriber.
//!
//! [`MemoryBackend`] is the production implementation: a `moka` cache
//! weighted by payload bytes with per-entry TTL.
//!
//! [`EvictionReconciler`]: crate::reconciler::EvictionReconciler

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::BackendError;
use crate::id::ArtifactId;

/// Default backend capacity: 1 GiB of payload bytes.
pub const DEFAULT_CAPACITY_BYTES: u64 = 1 << 30;

/// Why the backend dropped an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReclamationKind {
    /// TTL elapsed.
    Expired,
    /// Removed to make room.
    Evicted,
    /// Explicitly removed.
    Removed,
    /// Storage torn down (node shutdown, cache destroyed).
    Destroyed,
    /// Value overwritten under the same id. The artifact is still live.
    Replaced,
}

impl ReclamationKind {
    /// Upper-case event name used in logs and metric names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "EXPIRED",
            Self::Evicted => "EVICTED",
            Self::Removed => "REMOVED",
            Self::Destroyed => "DESTROYED",
            Self::Replaced => "REPLACED",
        }
    }

    /// Whether the artifact is gone after this event.
    pub fn reclaims(&self) -> bool {
        !matches!(self, Self::Replaced)
    }
}

impl fmt::Display for ReclamationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RemovalCause> for ReclamationKind {
    fn from(cause: RemovalCause) -> Self {
        match cause {
            RemovalCause::Expired => Self::Expired,
            RemovalCause::Explicit => Self::Removed,
            RemovalCause::Replaced => Self::Replaced,
            RemovalCause::Size => Self::Evicted,
        }
    }
}

/// Notification that the backend no longer holds an artifact.
///
/// Delivery is at-least-once; consumers must be idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclamationEvent {
    /// The reclaimed artifact.
    pub id: ArtifactId,
    /// What caused it.
    pub kind: ReclamationKind,
}

/// Receiving half of a backend's reclamation channel.
pub type ReclamationStream = UnboundedReceiver<ReclamationEvent>;

/// Result of a backend health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Serving normally.
    Healthy,
    /// Reachable but not fit to serve, with a reason.
    Unhealthy(String),
}

impl HealthStatus {
    /// Whether the backend can serve requests.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// A payload as handed to the backend.
#[derive(Debug, Clone)]
pub struct Blob {
    /// Raw artifact bytes.
    pub payload: Bytes,
    /// Time to live; `None` keeps the entry until evicted.
    pub ttl: Option<Duration>,
}

/// Key/value storage for artifact payloads with reclamation events.
///
/// Implementations must be safe to call from many request tasks at once
/// and must never block on the reclamation channel.
pub trait BlobBackend: Send + Sync + 'static {
    /// Store a blob under a fresh id.
    fn insert(&self, id: ArtifactId, blob: Blob) -> Result<(), BackendError>;

    /// Fetch a payload. `Ok(None)` means the id is not live.
    fn get(&self, id: ArtifactId) -> Result<Option<Bytes>, BackendError>;

    /// Whether the id is live, without touching the payload.
    fn contains(&self, id: ArtifactId) -> Result<bool, BackendError>;

    /// Drop a blob. Dropping an absent id is a no-op.
    fn discard(&self, id: ArtifactId) -> Result<(), BackendError>;

    /// Probe the backend.
    fn health(&self) -> HealthStatus;

    /// Hand out the reclamation channel. Returns `None` once it has been taken.
    fn subscribe(&self) -> Option<ReclamationStream>;
}

struct BlobExpiry;

impl Expiry<ArtifactId, Blob> for BlobExpiry {
    fn expire_after_create(
        &self,
        _key: &ArtifactId,
        value: &Blob,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process backend on top of `moka`.
///
/// Capacity is measured in payload bytes. Payloads larger than `u32::MAX`
/// bytes weigh `u32::MAX`.
pub struct MemoryBackend {
    blobs: Cache<ArtifactId, Blob>,
    events: Mutex<Option<ReclamationStream>>,
    capacity_bytes: u64,
}

impl MemoryBackend {
    /// Build a backend holding at most `capacity_bytes` of payload.
    pub fn new(capacity_bytes: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let blobs = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_id: &ArtifactId, blob: &Blob| -> u32 {
                u32::try_from(blob.payload.len()).unwrap_or(u32::MAX)
            })
            .expire_after(BlobExpiry)
            .eviction_listener(Self::listener(tx))
            .build();

        Self {
            blobs,
            events: Mutex::new(Some(rx)),
            capacity_bytes,
        }
    }

    fn listener(
        tx: UnboundedSender<ReclamationEvent>,
    ) -> impl Fn(Arc<ArtifactId>, Blob, RemovalCause) + Send + Sync + 'static {
        move |id, _blob, cause| {
            let event = ReclamationEvent {
                id: *id,
                kind: cause.into(),
            };
            if tx.send(event).is_err() {
                tracing::debug!(id = %event.id, kind = %event.kind, "reclamation event dropped: no subscriber");
            }
        }
    }

    /// Configured capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Number of blobs currently held (approximate until pending work runs).
    pub fn entry_count(&self) -> u64 {
        self.blobs.entry_count()
    }

    /// Run pending expiry and eviction work now, delivering its events.
    pub fn run_pending_tasks(&self) {
        self.blobs.run_pending_tasks();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("capacity_bytes", &self.capacity_bytes)
            .field("entry_count", &self.blobs.entry_count())
            .finish()
    }
}

impl BlobBackend for MemoryBackend {
    fn insert(&self, id: ArtifactId, blob: Blob) -> Result<(), BackendError> {
        self.blobs.insert(id, blob);
        Ok(())
    }

    fn get(&self, id: ArtifactId) -> Result<Option<Bytes>, BackendError> {
        Ok(self.blobs.get(&id).map(|blob| blob.payload))
    }

    fn contains(&self, id: ArtifactId) -> Result<bool, BackendError> {
        Ok(self.blobs.contains_key(&id))
    }

    fn discard(&self, id: ArtifactId) -> Result<(), BackendError> {
        self.blobs.invalidate(&id);
        Ok(())
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    fn subscribe(&self) -> Option<ReclamationStream> {
        self.events.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize, ttl: Option<Duration>) -> Blob {
        Blob {
            payload: Bytes::from(vec![0xAB; len]),
            ttl,
        }
    }

    fn drain(rx: &mut ReclamationStream) -> Vec<ReclamationEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn insert_get_discard() {
        let backend = MemoryBackend::new(1024);
        let id = ArtifactId::new(1);
        backend.insert(id, blob(10, None)).unwrap();

        assert!(backend.contains(id).unwrap());
        assert_eq!(backend.get(id).unwrap().unwrap().len(), 10);

        backend.discard(id).unwrap();
        assert!(!backend.contains(id).unwrap());
        assert!(backend.get(id).unwrap().is_none());
    }

    #[test]
    fn discarding_absent_id_is_noop() {
        let backend = MemoryBackend::new(1024);
        backend.discard(ArtifactId::new(99)).unwrap();
    }

    #[test]
    fn subscribe_hands_out_channel_once() {
        let backend = MemoryBackend::default();
        assert!(backend.subscribe().is_some());
        assert!(backend.subscribe().is_none());
    }

    #[test]
    fn explicit_discard_reports_removed() {
        let backend = MemoryBackend::new(1024);
        let mut rx = backend.subscribe().unwrap();
        let id = ArtifactId::new(3);
        backend.insert(id, blob(8, None)).unwrap();
        backend.discard(id).unwrap();
        backend.run_pending_tasks();

        let events = drain(&mut rx);
        assert!(
            events.contains(&ReclamationEvent {
                id,
                kind: ReclamationKind::Removed
            }),
            "events: {events:?}"
        );
    }

    #[test]
    fn ttl_expiry_reports_expired() {
        let backend = MemoryBackend::new(1024);
        let mut rx = backend.subscribe().unwrap();
        let id = ArtifactId::new(4);
        backend
            .insert(id, blob(8, Some(Duration::from_millis(20))))
            .unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert!(backend.get(id).unwrap().is_none());
        backend.run_pending_tasks();

        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| e.id == id && e.kind == ReclamationKind::Expired),
            "events: {events:?}"
        );
    }

    #[test]
    fn capacity_pressure_reports_evicted() {
        let backend = MemoryBackend::new(100);
        let mut rx = backend.subscribe().unwrap();
        for raw in 1..=5 {
            backend.insert(ArtifactId::new(raw), blob(60, None)).unwrap();
            backend.run_pending_tasks();
        }

        let events = drain(&mut rx);
        assert!(
            events.iter().any(|e| e.kind == ReclamationKind::Evicted),
            "events: {events:?}"
        );
        assert!(backend.entry_count() <= 1);
    }

    #[test]
    fn removal_causes_map_to_kinds() {
        assert_eq!(ReclamationKind::from(RemovalCause::Expired), ReclamationKind::Expired);
        assert_eq!(ReclamationKind::from(RemovalCause::Size), ReclamationKind::Evicted);
        assert_eq!(ReclamationKind::from(RemovalCause::Explicit), ReclamationKind::Removed);
        assert_eq!(ReclamationKind::from(RemovalCause::Replaced), ReclamationKind::Replaced);
        assert!(!ReclamationKind::Replaced.reclaims());
        assert!(ReclamationKind::Destroyed.reclaims());
    }
}
