// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory content-addressed blob store.
//!
//! [`MemoryStore`] backs unit tests and the worker-side staging area for blobs
//! pulled over the wire but not yet spilled to disk.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{digest_of, BlobStore, CasError, Digest};

/// In-memory content-addressed blob store.
///
/// Stores blobs in an `FxHashMap<Digest, Arc<[u8]>>` and tracks a pin-set for
/// retention roots. An optional byte budget is advisory — `put` always
/// succeeds but [`is_over_budget`](MemoryStore::is_over_budget) reports when
/// the budget is exceeded. Enforced eviction belongs to [`DiskStore`]
/// (`crate::DiskStore`), which owns the persistent cache.
///
/// # Pinning Invariants
///
/// - `pin` on a missing blob is legal (records intent before the blob arrives).
/// - `put` of a pre-pinned digest preserves the pin.
/// - `unpin` on a missing blob is a no-op.
/// - Pin count is set cardinality, not reference count.
pub struct MemoryStore {
    blobs: FxHashMap<Digest, Arc<[u8]>>,
    pins: FxHashSet<Digest>,
    byte_count: usize,
    max_bytes: Option<usize>,
}

impl MemoryStore {
    /// Create an empty store with no byte limit.
    pub fn new() -> Self {
        Self {
            blobs: FxHashMap::default(),
            pins: FxHashSet::default(),
            byte_count: 0,
            max_bytes: None,
        }
    }

    /// Create an empty store with an advisory byte budget.
    pub fn with_budget(max_bytes: usize) -> Self {
        Self {
            blobs: FxHashMap::default(),
            pins: FxHashSet::default(),
            byte_count: 0,
            max_bytes: Some(max_bytes),
        }
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns `true` if no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Returns `true` if the given digest is in the pin-set.
    pub fn is_pinned(&self, digest: &Digest) -> bool {
        self.pins.contains(digest)
    }

    /// Total bytes stored across all blobs.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// Returns `true` if `byte_count` exceeds the configured budget.
    ///
    /// Always returns `false` if no budget was set.
    pub fn is_over_budget(&self) -> bool {
        self.max_bytes.is_some_and(|max| self.byte_count > max)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryStore {
    fn put(&mut self, bytes: &[u8]) -> Result<Digest, CasError> {
        let digest = digest_of(bytes);
        if self.blobs.contains_key(&digest) {
            return Ok(digest);
        }
        self.byte_count += bytes.len();
        self.blobs.insert(digest, Arc::from(bytes));
        Ok(digest)
    }

    fn put_verified(&mut self, expected: Digest, bytes: &[u8]) -> Result<(), CasError> {
        let computed = digest_of(bytes);
        if computed != expected {
            return Err(CasError::HashMismatch { expected, computed });
        }
        if !self.blobs.contains_key(&computed) {
            self.byte_count += bytes.len();
            self.blobs.insert(computed, Arc::from(bytes));
        }
        Ok(())
    }

    fn get(&self, digest: &Digest) -> Option<Arc<[u8]>> {
        self.blobs.get(digest).cloned()
    }

    fn has(&self, digest: &Digest) -> bool {
        self.blobs.contains_key(digest)
    }

    fn pin(&mut self, digest: &Digest) {
        self.pins.insert(*digest);
    }

    fn unpin(&mut self, digest: &Digest) {
        self.pins.remove(digest);
    }
}
