// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content-addressed blob storage for builder.
//!
//! `builder-cas` provides a [`BlobStore`] trait for content-addressed storage
//! keyed by BLAKE3 digest, with two implementations: [`MemoryStore`] for tests
//! and worker-side staging, and [`DiskStore`] for the persistent cache shared
//! across builds.
//!
//! # Hash Domain Policy
//!
//! The CAS digest is content-only: `BLAKE3(bytes)` with no domain prefix. Two
//! blobs with identical bytes are the same blob regardless of which action
//! produced them — deduplication is the point. Domain separation lives one
//! layer up, in the action-key derivation of `builder-cache`, which frames
//! every hashed field with its length.
//!
//! # Absence Semantics
//!
//! [`get`](BlobStore::get) returns `None` for missing blobs — this is **not**
//! an error. A CAS is a lookup table: missing blobs are expected (evicted,
//! never fetched, produced elsewhere). Error values are reserved for integrity
//! violations and I/O failures on the write path; corruption discovered on the
//! read path degrades to absence so a damaged cache can never fail a build.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use std::sync::Arc;

/// A 32-byte BLAKE3 content digest.
///
/// Thin newtype over `[u8; 32]`. The inner bytes are public for zero-cost
/// access; the `Display` impl renders lowercase hex for logging and error
/// messages.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// The digest of the empty byte string.
    pub fn of_empty() -> Self {
        digest_of(&[])
    }

    /// View the digest as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render the digest as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string (either case).
    ///
    /// Returns `None` on wrong length or non-hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let raw: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(raw))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Compute the BLAKE3 content digest of `bytes`.
///
/// No domain prefix — the content IS the identity. See module-level docs for
/// the hash domain policy.
pub fn digest_of(bytes: &[u8]) -> Digest {
    let hash = blake3::hash(bytes);
    Digest(*hash.as_bytes())
}

/// Errors that can occur during CAS operations.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// Blob bytes did not match the declared digest.
    #[error("[CAS_HASH_MISMATCH] expected {expected}, computed {computed}")]
    HashMismatch {
        /// The digest that was declared/expected.
        expected: Digest,
        /// The digest actually computed from the bytes.
        computed: Digest,
    },

    /// Underlying filesystem failure on the write path.
    #[error("[CAS_IO] {0}")]
    Io(#[from] std::io::Error),
}

/// Content-addressed blob store.
///
/// Implementations store opaque byte blobs keyed by their BLAKE3 digest. The
/// trait is synchronous and object-safe; callers that share a store across
/// threads wrap it in a mutex (the action cache does exactly that).
///
/// # Pinning
///
/// Pins are retention roots held by in-flight builds: eviction must never
/// remove a pinned blob. Pin semantics are set-based, not reference-counted;
/// `pin` on a missing digest is legal (pre-pin intent before the blob lands).
pub trait BlobStore {
    /// Compute the digest and store the blob. Returns the content digest.
    ///
    /// Idempotent: storing bytes already present touches recency and returns
    /// the same digest.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the backing store cannot persist the blob.
    fn put(&mut self, bytes: &[u8]) -> Result<Digest, CasError>;

    /// Store with a pre-computed digest. Rejects if `BLAKE3(bytes)` differs.
    ///
    /// On mismatch the store is unchanged. This method exists for receivers of
    /// `PutBlob` frames who already hold the digest from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::HashMismatch`] if the computed digest differs from
    /// `expected`, or [`CasError::Io`] on persistence failure.
    fn put_verified(&mut self, expected: Digest, bytes: &[u8]) -> Result<(), CasError>;

    /// Retrieve a blob by digest. Returns `None` if not stored — absence is
    /// not an error, and neither is corruption (a damaged blob reads as
    /// absent and is logged).
    fn get(&self, digest: &Digest) -> Option<Arc<[u8]>>;

    /// Check existence without retrieving.
    fn has(&self, digest: &Digest) -> bool;

    /// Mark a digest as a retention root. Legal on missing blobs.
    fn pin(&mut self, digest: &Digest);

    /// Remove a retention root. No-op if not pinned or not stored.
    fn unpin(&mut self, digest: &Digest);
}
