//! # Eviction Reconciler
//!
//! Consumes the backend's reclamation channel and removes the keys,
//! reverse entry and metadata of every artifact the backend dropped.
//!
//! The binding between backend and reconciler is the single call
//! [`EvictionReconciler::bind`]: it takes the backend's one subscription and
//! spawns the task that drains it. Binding twice fails with
//! [`BindError::AlreadyBound`], so a store whose events nobody consumes, or
//! that two consumers race over, is caught at startup.
//!
//! Events are at-least-once. Handling is idempotent, and a key that a newer
//! put has repointed is never unlinked (see [`ArtifactStore::reclaim`]).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::backend::{ReclamationEvent, ReclamationStream};
use crate::metrics;
use crate::store::{ArtifactStore, ReclaimOutcome};

/// The backend's reclamation channel was already taken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("backend reclamation channel already has a subscriber")]
    AlreadyBound,
}

/// Restores index consistency after backend reclamation.
#[derive(Debug, Clone)]
pub struct EvictionReconciler {
    store: Arc<ArtifactStore>,
}

impl EvictionReconciler {
    /// Create a reconciler for `store`. Nothing is consumed until
    /// [`run`](Self::run) or [`bind`](Self::bind).
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self { store }
    }

    /// Subscribe to `store`'s backend and spawn the draining task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(store: Arc<ArtifactStore>) -> Result<JoinHandle<()>, BindError> {
        let events = store.backend().subscribe().ok_or(BindError::AlreadyBound)?;
        let reconciler = Self::new(store);
        tracing::info!("eviction reconciler bound to backend reclamation channel");
        Ok(tokio::spawn(reconciler.run(events)))
    }

    /// Apply one event. Never panics on missing or already-cleaned entries.
    pub fn handle(&self, event: ReclamationEvent) -> ReclaimOutcome {
        ::metrics::counter!(metrics::RECLAMATION_EVENT_COUNT, "kind" => event.kind.as_str())
            .increment(1);

        if !event.kind.reclaims() {
            tracing::debug!(id = %event.id, kind = %event.kind, "artifact still live; ignoring event");
            return ReclaimOutcome::default();
        }

        let outcome = self.store.reclaim(event.id);
        ::metrics::counter!(metrics::RECLAIMED_KEY_COUNT).increment(outcome.keys_unlinked as u64);

        if outcome.is_noop() {
            tracing::debug!(id = %event.id, kind = %event.kind, "reclamation already applied");
        } else {
            tracing::info!(
                id = %event.id,
                kind = %event.kind,
                keys_unlinked = outcome.keys_unlinked,
                keys_repointed = outcome.keys_repointed,
                "reclaimed artifact"
            );
        }
        outcome
    }

    /// Drain `events` until the backend drops its sender.
    ///
    /// A panic while handling one event is logged and the loop moves on to
    /// the next event.
    pub async fn run(self, mut events: ReclamationStream) {
        while let Some(event) = events.recv().await {
            if catch_unwind(AssertUnwindSafe(|| self.handle(event))).is_err() {
                tracing::error!(id = %event.id, kind = %event.kind, "panic while reconciling; continuing");
            }
        }
        tracing::info!("reclamation channel closed; eviction reconciler stopping");
    }
}
