//! # Artifact Store
//!
//! Four logical indexes over one blob backend:
//!
//! ```text
//! blob      ArtifactId ─► payload               (BlobBackend)
//! metadata  ArtifactId ─► MetadataRecord        (DashMap)
//! forward   key        ─► ArtifactId            (striped RwLock<HashMap>)
//! reverse   ArtifactId ─► {key, ...}            (DashMap)
//! ```
//!
//! ## Invariants
//!
//! 1. `forward[k] == U` if and only if `k ∈ reverse[U]`.
//! 2. No forward entry resolves to an id without a live blob, as observed
//!    by [`ArtifactStore::get`]; a dangling entry is reported as
//!    [`StoreError::ConsistencyViolation`], never a panic.
//!
//! ## Concurrency
//!
//! The forward index is split into [`STRIPES`] independently locked
//! stripes. A put locks every stripe its keys hash to, in ascending stripe
//! order, and writes the reverse entry plus all forward entries while
//! holding them, so readers observe either none or all of a put's keys.
//! Cleanup ([`ArtifactStore::reclaim`]) only unlinks a key while it still
//! points at the reclaimed id, so it can never undo a newer put.
//!
//! ## Re-put Policy
//!
//! Keys are last-write-wins. When a put repoints a key, the key is removed
//! from the old artifact's reverse set right away. An old artifact left with
//! no keys is reclaimed immediately instead of waiting for the backend to
//! evict it.

use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::backend::{Blob, BlobBackend, HealthStatus};
use crate::error::StoreError;
use crate::id::{ArtifactId, SequenceGenerator};
use crate::metrics::{self, CacheTags};

/// Number of forward-index stripes.
pub const STRIPES: usize = 64;

/// Bookkeeping kept apart from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Payload length in bytes.
    pub size: u64,
    /// Tags supplied with the put.
    pub tags: CacheTags,
    /// When the put completed.
    pub stored_at: Instant,
    /// When the backend will expire the blob, if a TTL was given.
    pub expires_at: Option<Instant>,
}

impl MetadataRecord {
    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A resolved cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Backing artifact.
    pub id: ArtifactId,
    /// Raw bytes.
    pub payload: Bytes,
    /// Payload length.
    pub size: u64,
}

/// Key and artifact counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Summary {
    /// Distinct external keys with a live mapping.
    pub keys: usize,
    /// Underlying artifacts with metadata.
    pub artifacts: usize,
}

/// What [`ArtifactStore::reclaim`] cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReclaimOutcome {
    /// Forward entries removed because they still pointed at the id.
    pub keys_unlinked: usize,
    /// Keys left alone because a newer put had repointed them.
    pub keys_repointed: usize,
    /// Whether a metadata record was removed.
    pub metadata_removed: bool,
}

impl ReclaimOutcome {
    /// Whether nothing was left to clean up (e.g. a duplicate event).
    pub fn is_noop(&self) -> bool {
        self.keys_unlinked == 0 && self.keys_repointed == 0 && !self.metadata_removed
    }
}

/// A broken link between the indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexViolation {
    /// `forward[key] == id` but `key ∉ reverse[id]`.
    ForwardWithoutReverse { key: String, id: ArtifactId },
    /// `key ∈ reverse[id]` but `forward[key] != id`.
    ReverseWithoutForward { key: String, id: ArtifactId },
    /// `reverse[id]` exists without `metadata[id]`.
    ReverseWithoutMetadata { id: ArtifactId },
}

type ForwardStripe = RwLock<HashMap<String, ArtifactId>>;

/// The keyed artifact store.
pub struct ArtifactStore {
    backend: Arc<dyn BlobBackend>,
    ids: SequenceGenerator,
    forward: Box<[ForwardStripe]>,
    hasher: RandomState,
    reverse: DashMap<ArtifactId, HashSet<String>>,
    metadata: DashMap<ArtifactId, MetadataRecord>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("artifacts", &self.metadata.len())
            .field("reverse_entries", &self.reverse.len())
            .finish()
    }
}

impl ArtifactStore {
    /// Build a store over `backend`.
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self::with_sequence(backend, SequenceGenerator::new())
    }

    /// Build a store with an explicit id sequence.
    pub fn with_sequence(backend: Arc<dyn BlobBackend>, ids: SequenceGenerator) -> Self {
        Self {
            backend,
            ids,
            forward: (0..STRIPES).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            reverse: DashMap::new(),
            metadata: DashMap::new(),
        }
    }

    /// The backend this store writes to.
    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    fn stripe_index(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) as usize) % self.forward.len()
    }

    fn stripe(&self, key: &str) -> &ForwardStripe {
        &self.forward[self.stripe_index(key)]
    }

    /// Store `payload` under every key in `keys`.
    ///
    /// Always allocates a fresh id. Duplicate keys are collapsed. An empty
    /// key set is accepted here (the blob is simply unreachable and is
    /// reclaimed at once); request validation belongs to the codec.
    pub fn put(
        &self,
        keys: &[String],
        payload: Bytes,
        ttl: Option<Duration>,
        tags: CacheTags,
    ) -> Result<ArtifactId, StoreError> {
        let id = self.ids.next_id();
        let size = payload.len() as u64;
        let now = Instant::now();

        self.backend.insert(id, Blob { payload, ttl })?;
        self.metadata.insert(
            id,
            MetadataRecord {
                size,
                tags,
                stored_at: now,
                expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            },
        );

        let key_set: HashSet<String> = keys.iter().cloned().collect();
        let orphans = self.link(id, &key_set);

        for old in orphans {
            tracing::debug!(old = %old, new = %id, "reclaiming artifact orphaned by re-put");
            ::metrics::counter!(metrics::ORPHAN_RECLAIM_COUNT).increment(1);
            self.reclaim(old);
        }

        // The backend may already have dropped the blob (capacity pressure,
        // zero TTL) before the links above existed. Its event could have been
        // processed against empty indexes, so clean up here.
        if key_set.is_empty() || matches!(self.backend.contains(id), Ok(false)) {
            tracing::debug!(id = %id, "artifact reclaimed before put completed");
            self.reclaim(id);
        }

        Ok(id)
    }

    /// Write the reverse entry and all forward entries for `id` atomically
    /// with respect to readers. Returns old ids left without keys.
    fn link(&self, id: ArtifactId, keys: &HashSet<String>) -> Vec<ArtifactId> {
        let mut groups: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for key in keys {
            groups.entry(self.stripe_index(key)).or_default().push(key);
        }

        // Ascending stripe order keeps concurrent puts deadlock-free.
        let mut locked: Vec<_> = groups
            .iter()
            .map(|(idx, group)| (self.forward[*idx].write(), group))
            .collect();

        if !keys.is_empty() {
            self.reverse.insert(id, keys.clone());
        }

        let mut orphans = Vec::new();
        for (stripe, group) in locked.iter_mut() {
            for key in group.iter() {
                let Some(old) = stripe.insert((*key).to_string(), id) else {
                    continue;
                };
                if old == id {
                    continue;
                }
                let emptied = match self.reverse.get_mut(&old) {
                    Some(mut members) => {
                        members.remove(*key);
                        members.is_empty()
                    }
                    None => false,
                };
                if emptied && self.reverse.remove_if(&old, |_, m| m.is_empty()).is_some() {
                    orphans.push(old);
                }
            }
        }

        if cfg!(debug_assertions) {
            for (stripe, group) in &locked {
                for key in group.iter() {
                    self.check_link(key, stripe.get(*key).copied(), id);
                }
            }
        }

        orphans
    }

    /// Resolve `key` to its payload.
    ///
    /// A blob that vanishes between the lookup and the fetch is only an
    /// error if `key` still points at it; if a concurrent put repointed the
    /// key (and reclaimed the old artifact) the lookup starts over.
    pub fn get(&self, key: &str) -> Result<StoredArtifact, StoreError> {
        let mut id = self.resolve(key).ok_or(StoreError::NotFound)?;
        loop {
            if let Some(payload) = self.backend.get(id)? {
                return Ok(StoredArtifact {
                    id,
                    size: payload.len() as u64,
                    payload,
                });
            }

            match self.resolve(key) {
                Some(current) if current != id => {
                    tracing::trace!(key = %key, stale = %id, current = %current, "key repointed during read; retrying");
                    id = current;
                }
                None => return Err(StoreError::NotFound),
                Some(_) => break,
            }
        }

        match self.metadata.get(&id).map(|m| m.value().clone()) {
            // Expired but not yet reconciled: an ordinary miss.
            Some(meta) if meta.is_expired(Instant::now()) => Err(StoreError::NotFound),
            _ => Err(StoreError::ConsistencyViolation {
                key: key.to_string(),
                id,
            }),
        }
    }

    /// Metadata for an artifact, if it is still tracked.
    pub fn metadata(&self, id: ArtifactId) -> Option<MetadataRecord> {
        self.metadata.get(&id).map(|m| m.value().clone())
    }

    /// The id `key` currently resolves to.
    pub fn resolve(&self, key: &str) -> Option<ArtifactId> {
        self.stripe(key).read().get(key).copied()
    }

    /// Keys currently linked to `id`.
    pub fn keys_of(&self, id: ArtifactId) -> HashSet<String> {
        self.reverse
            .get(&id)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    /// Count keys and artifacts. Takes each stripe's read lock in turn, so
    /// writers are never blocked for more than one stripe at a time.
    pub fn summary(&self) -> Summary {
        let keys = self.forward.iter().map(|stripe| stripe.read().len()).sum();
        Summary {
            keys,
            artifacts: self.metadata.len(),
        }
    }

    /// Probe the backend.
    pub fn health(&self) -> HealthStatus {
        self.backend.health()
    }

    /// Remove every index entry of `id` and discard its blob.
    ///
    /// Idempotent: reclaiming an id twice, or an id that was never stored,
    /// does nothing the second time. Keys that a newer put has repointed are
    /// left untouched.
    pub fn reclaim(&self, id: ArtifactId) -> ReclaimOutcome {
        let mut outcome = ReclaimOutcome::default();
        let keys = self
            .reverse
            .remove(&id)
            .map(|(_, keys)| keys)
            .unwrap_or_default();

        for key in &keys {
            let mut stripe = self.stripe(key).write();
            match stripe.get(key.as_str()).copied() {
                Some(current) if current == id => {
                    stripe.remove(key.as_str());
                    outcome.keys_unlinked += 1;
                }
                Some(current) => {
                    tracing::debug!(key = %key, reclaimed = %id, current = %current, "key repointed; leaving mapping");
                    outcome.keys_repointed += 1;
                }
                None => {}
            }
            if cfg!(debug_assertions) {
                self.check_unlinked(key, stripe.get(key.as_str()).copied(), id);
            }
        }

        outcome.metadata_removed = self.metadata.remove(&id).is_some();

        if let Err(err) = self.backend.discard(id) {
            tracing::warn!(id = %id, error = %err, "failed to discard reclaimed blob");
        }

        outcome
    }

    fn check_link(&self, key: &str, forward: Option<ArtifactId>, id: ArtifactId) {
        let in_reverse = self.reverse.get(&id).is_some_and(|m| m.contains(key));
        if forward != Some(id) || !in_reverse {
            tracing::error!(
                key = %key,
                id = %id,
                forward = ?forward,
                in_reverse,
                "index link broken after put"
            );
        }
    }

    fn check_unlinked(&self, key: &str, forward: Option<ArtifactId>, id: ArtifactId) {
        if forward == Some(id) {
            tracing::error!(key = %key, id = %id, "forward entry survived reclaim");
        }
    }

    /// Scan all indexes and report broken links.
    ///
    /// Not a snapshot; only meaningful while no writers are active.
    pub fn check_consistency(&self) -> Vec<IndexViolation> {
        let mut violations = Vec::new();

        for stripe in self.forward.iter() {
            for (key, id) in stripe.read().iter() {
                let linked = self.reverse.get(id).is_some_and(|m| m.contains(key));
                if !linked {
                    violations.push(IndexViolation::ForwardWithoutReverse {
                        key: key.clone(),
                        id: *id,
                    });
                }
            }
        }

        // Copy out first: resolving under a reverse shard lock would invert
        // the stripe-then-reverse order `link` uses.
        let reverse: Vec<(ArtifactId, HashSet<String>)> = self
            .reverse
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, members) in reverse {
            if !self.metadata.contains_key(&id) {
                violations.push(IndexViolation::ReverseWithoutMetadata { id });
            }
            for key in members {
                if self.resolve(&key) != Some(id) {
                    violations.push(IndexViolation::ReverseWithoutForward { key, id });
                }
            }
        }

        violations
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::backend::MemoryBackend;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Put(Vec<u8>),
        Reclaim(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => proptest::collection::vec(0u8..6, 1..4).prop_map(Op::Put),
            1 => (0usize..32).prop_map(Op::Reclaim),
        ]
    }

    proptest! {
        /// Any interleaving of puts and reclamations leaves the indexes
        /// consistent, and every linked key serves its blob.
        #[test]
        fn indexes_stay_consistent(ops in proptest::collection::vec(op(), 1..40)) {
            let store = ArtifactStore::new(Arc::new(MemoryBackend::new(1 << 20)));
            let mut issued = Vec::new();

            for op in ops {
                match op {
                    Op::Put(picks) => {
                        let keys: Vec<String> = picks.iter().map(|k| format!("k{k}")).collect();
                        issued.push(store.put(&keys, Bytes::from_static(b"blob"), None, CacheTags::none()).unwrap());
                    }
                    Op::Reclaim(i) if !issued.is_empty() => {
                        store.reclaim(issued[i % issued.len()]);
                    }
                    Op::Reclaim(_) => {}
                }
                prop_assert_eq!(store.check_consistency(), Vec::new());
            }

            for k in 0u8..6 {
                let key = format!("k{k}");
                match store.resolve(&key) {
                    Some(id) => prop_assert_eq!(store.get(&key).map(|a| a.id), Ok(id)),
                    None => prop_assert_eq!(store.get(&key), Err(StoreError::NotFound)),
                }
            }
        }
    }
}
