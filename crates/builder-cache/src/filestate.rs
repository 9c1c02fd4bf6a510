// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Two-tier file change detection.
//!
//! The fast path compares the metadata tuple `(size, mtime_ns, mode)` against
//! the last recorded state — microseconds per file, no reads. On any tuple
//! difference the content is rehashed, and only an actual content change
//! propagates into the action key. The tuple is then re-recorded, so a bare
//! `touch` costs one rehash on the next build and nothing afterwards.
//!
//! # The mtime trap
//!
//! Correctness of the fast path assumes mtime moves when content moves. On
//! filesystems with coarse timestamps a rapid edit can leave mtime unchanged.
//! The tracker detects the symptom — identical recorded mtime with differing
//! content seen during a slow-path rehash — and permanently marks the path
//! `mtime_unreliable`, pinning it to the rehash path from then on.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use builder_cas::{digest_of, Digest};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::CacheError;

const SHARDS: usize = 16;

/// Recorded state of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// File size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub mtime_ns: u64,
    /// Unix permission bits (zero on platforms without them).
    pub mode: u32,
    /// Content digest as of the last rehash.
    pub digest: Digest,
    /// Set once an equal-mtime content change has been observed; disables the
    /// metadata fast path for this file forever.
    pub mtime_unreliable: bool,
}

/// What a change probe concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Metadata tuple matched; recorded digest reused without reading.
    MetadataHit,
    /// Metadata differed but content was unchanged (e.g. `touch`).
    Rehashed,
    /// Content actually changed.
    Changed,
}

/// Sharded tracker of [`FileState`] across builds.
///
/// Shards are keyed by the parent directory so files in one package contend
/// on one lock but packages proceed independently.
pub struct FileStateTracker {
    shards: Vec<Mutex<FxHashMap<PathBuf, FileState>>>,
}

impl Default for FileStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStateTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS)
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
        }
    }

    fn shard_for(&self, rel: &Path) -> &Mutex<FxHashMap<PathBuf, FileState>> {
        use std::hash::{Hash, Hasher};
        let prefix = rel.parent().unwrap_or(rel);
        let mut hasher = rustc_hash::FxHasher::default();
        prefix.hash(&mut hasher);
        let index = (hasher.finish() as usize) % SHARDS;
        &self.shards[index]
    }

    /// Probe `rel` (resolved against `root`), returning its content digest
    /// and how it was obtained.
    ///
    /// # Errors
    ///
    /// [`CacheError::MissingInput`] when the file does not exist;
    /// [`CacheError::Io`] for other filesystem failures.
    pub fn probe(&self, root: &Path, rel: &Path) -> Result<(Digest, Freshness), CacheError> {
        let abs = root.join(rel);
        let meta = match fs::metadata(&abs) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::MissingInput {
                    path: rel.to_path_buf(),
                })
            }
            Err(err) => return Err(CacheError::Io(err)),
        };
        let observed = observed_tuple(&meta);

        let shard = self.shard_for(rel);
        let mut map = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let recorded = map.get(rel).cloned();

        if let Some(state) = &recorded {
            let tuple_matches = state.size == observed.0
                && state.mtime_ns == observed.1
                && state.mode == observed.2;
            if tuple_matches && !state.mtime_unreliable {
                return Ok((state.digest, Freshness::MetadataHit));
            }
        }

        // Slow path: read and rehash.
        let bytes = fs::read(&abs)?;
        let digest = digest_of(&bytes);

        let (freshness, unreliable) = match &recorded {
            Some(state) if state.digest == digest => {
                // Content unchanged; just refresh the tuple.
                (Freshness::Rehashed, state.mtime_unreliable)
            }
            Some(state) => {
                // Content changed. If mtime did not move with it, the
                // filesystem clock cannot be trusted for this file.
                let unreliable = state.mtime_unreliable || state.mtime_ns == observed.1;
                if unreliable && !state.mtime_unreliable {
                    warn!(path = %rel.display(), "mtime did not advance across a content change; disabling fast path");
                }
                (Freshness::Changed, unreliable)
            }
            None => (Freshness::Changed, false),
        };

        map.insert(
            rel.to_path_buf(),
            FileState {
                size: observed.0,
                mtime_ns: observed.1,
                mode: observed.2,
                digest,
                mtime_unreliable: unreliable,
            },
        );
        Ok((digest, freshness))
    }

    /// Snapshot all tracked states (for the `state/files` journal).
    pub fn snapshot(&self) -> Vec<(PathBuf, FileState)> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let map = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            all.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Load previously journaled states.
    pub fn load(&self, states: Vec<(PathBuf, FileState)>) {
        for (path, state) in states {
            let shard = self.shard_for(&path);
            shard
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(path, state);
        }
    }
}

fn observed_tuple(meta: &fs::Metadata) -> (u64, u64, u32) {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = 0u32;
    (meta.len(), mtime_ns, mode)
}
