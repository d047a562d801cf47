//! # Underlying Artifact Identifiers
//!
//! Every put gets a fresh [`ArtifactId`] from the [`SequenceGenerator`],
//! independent of the external keys that point at it. Ids are never reused
//! for the lifetime of a store, so a stale eviction notification can never
//! be confused with a newer artifact.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque numeric identifier of one stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactId(u64);

impl ArtifactId {
    /// Wrap a raw value. Only the generator and tests should need this.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Access the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing artifact ids.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    /// Start at 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start at an arbitrary value, e.g. after restoring a backend.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> ArtifactId {
        ArtifactId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
