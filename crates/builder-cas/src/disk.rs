// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Disk-backed content-addressed blob store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<digest[0:2]>/<digest[2:4]>/<digest>    blob file, mode 0o444
//! ```
//!
//! Writes go through a staging file in the final directory followed by an
//! atomic rename, so a crash mid-write can never leave a half-blob under its
//! digest path. Eviction is LRU over a byte budget and never removes pinned
//! blobs — pins are held by in-flight builds whose action records reference
//! the blob.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::{digest_of, BlobStore, CasError, Digest};

/// Per-blob bookkeeping for the LRU index.
#[derive(Debug, Clone, Copy)]
struct BlobMeta {
    size: u64,
    /// Logical recency stamp; larger is more recent.
    last_used: u64,
}

/// Disk-backed content-addressed blob store with LRU eviction.
///
/// The on-disk tree is the source of truth; the in-memory index is rebuilt by
/// [`open`](DiskStore::open) from a directory walk. Recency stamps are a
/// logical clock, not wall time, so eviction order is stable regardless of
/// filesystem timestamp granularity.
pub struct DiskStore {
    root: PathBuf,
    index: FxHashMap<Digest, BlobMeta>,
    pins: FxHashSet<Digest>,
    byte_count: u64,
    max_bytes: Option<u64>,
    clock: u64,
}

impl DiskStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Walks the two-level fan-out directories and indexes every blob found.
    /// Files whose names do not parse as digests are ignored with a warning —
    /// they are typically orphaned staging files from a crashed writer.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the root cannot be created or read.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CasError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut index = FxHashMap::default();
        let mut byte_count = 0u64;
        for level1 in fs::read_dir(&root)? {
            let level1 = level1?;
            if !level1.file_type()?.is_dir() {
                continue;
            }
            for level2 in fs::read_dir(level1.path())? {
                let level2 = level2?;
                if !level2.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(level2.path())? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(digest) = name.to_str().and_then(Digest::from_hex) else {
                        warn!(path = %entry.path().display(), "ignoring non-digest file in cas");
                        continue;
                    };
                    let size = entry.metadata()?.len();
                    index.insert(
                        digest,
                        BlobMeta {
                            size,
                            last_used: 0,
                        },
                    );
                    byte_count += size;
                }
            }
        }
        Ok(Self {
            root,
            index,
            pins: FxHashSet::default(),
            byte_count,
            max_bytes: None,
            clock: 1,
        })
    }

    /// Open a store with an enforced byte budget.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the root cannot be created or read.
    pub fn open_with_budget(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, CasError> {
        let mut store = Self::open(root)?;
        store.max_bytes = Some(max_bytes);
        Ok(store)
    }

    /// Number of blobs currently indexed.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total bytes stored across all blobs.
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Returns `true` if the given digest is in the pin-set.
    pub fn is_pinned(&self, digest: &Digest) -> bool {
        self.pins.contains(digest)
    }

    /// Remove every blob and reset the index.
    ///
    /// The caller is responsible for honoring the clear contract: the action
    /// record index must be cleared before the CAS, never after.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if a blob file cannot be removed.
    pub fn clear(&mut self) -> Result<(), CasError> {
        for digest in self.index.keys().copied().collect::<Vec<_>>() {
            self.remove_file(&digest)?;
        }
        self.index.clear();
        self.byte_count = 0;
        Ok(())
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    fn touch(&mut self, digest: &Digest) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(meta) = self.index.get_mut(digest) {
            meta.last_used = clock;
        }
    }

    /// Stage-then-rename write of a new blob. Assumes the digest is absent.
    fn write_blob(&mut self, digest: Digest, bytes: &[u8]) -> Result<(), CasError> {
        let final_path = self.blob_path(&digest);
        let dir = final_path
            .parent()
            .ok_or_else(|| std::io::Error::other("blob path has no parent"))?;
        fs::create_dir_all(dir)?;

        // Stage in the same directory so the rename cannot cross filesystems.
        let stage_path = dir.join(format!(".stage-{}", digest.to_hex()));
        {
            let mut file = fs::File::create(&stage_path)?;
            file.write_all(bytes)?;
            // Durability before visibility: the record index commit in
            // builder-cache relies on renamed blobs being on stable storage.
            file.sync_all()?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&stage_path, fs::Permissions::from_mode(0o444))?;
        }
        fs::rename(&stage_path, &final_path)?;

        self.clock += 1;
        self.index.insert(
            digest,
            BlobMeta {
                size: bytes.len() as u64,
                last_used: self.clock,
            },
        );
        self.byte_count += bytes.len() as u64;
        self.evict_to_budget()?;
        Ok(())
    }

    fn remove_file(&mut self, digest: &Digest) -> Result<(), CasError> {
        let path = self.blob_path(digest);
        #[cfg(unix)]
        {
            // Blobs are written read-only; restore write permission so unlink
            // of the containing entry succeeds on filesystems that care.
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o644));
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CasError::Io(err)),
        }
    }

    /// Evict least-recently-used unpinned blobs until within budget.
    fn evict_to_budget(&mut self) -> Result<(), CasError> {
        let Some(max) = self.max_bytes else {
            return Ok(());
        };
        if self.byte_count <= max {
            return Ok(());
        }
        let mut candidates: Vec<(u64, Digest, u64)> = self
            .index
            .iter()
            .filter(|(digest, _)| !self.pins.contains(*digest))
            .map(|(digest, meta)| (meta.last_used, *digest, meta.size))
            .collect();
        candidates.sort_unstable_by_key(|(last_used, digest, _)| (*last_used, *digest));
        for (_, digest, size) in candidates {
            if self.byte_count <= max {
                break;
            }
            self.remove_file(&digest)?;
            self.index.remove(&digest);
            self.byte_count -= size;
        }
        if self.byte_count > max {
            // Everything left is pinned by an active build; over-budget is the
            // lesser evil versus breaking in-flight actions.
            warn!(
                byte_count = self.byte_count,
                max_bytes = max,
                "cas over budget with only pinned blobs remaining"
            );
        }
        Ok(())
    }
}

impl BlobStore for DiskStore {
    fn put(&mut self, bytes: &[u8]) -> Result<Digest, CasError> {
        let digest = digest_of(bytes);
        if self.index.contains_key(&digest) {
            self.touch(&digest);
            return Ok(digest);
        }
        self.write_blob(digest, bytes)?;
        Ok(digest)
    }

    fn put_verified(&mut self, expected: Digest, bytes: &[u8]) -> Result<(), CasError> {
        let computed = digest_of(bytes);
        if computed != expected {
            return Err(CasError::HashMismatch { expected, computed });
        }
        if self.index.contains_key(&computed) {
            self.touch(&computed);
            return Ok(());
        }
        self.write_blob(computed, bytes)
    }

    fn get(&self, digest: &Digest) -> Option<Arc<[u8]>> {
        if !self.index.contains_key(digest) {
            return None;
        }
        let path = self.blob_path(digest);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(digest = %digest, error = %err, "cas blob unreadable, treating as absent");
                return None;
            }
        };
        // Verify on read: a flipped bit must surface as a miss, not as wrong
        // outputs materialized into the workspace.
        let computed = digest_of(&bytes);
        if computed != *digest {
            warn!(expected = %digest, computed = %computed, "cas blob corrupt, treating as absent");
            return None;
        }
        Some(Arc::from(bytes.into_boxed_slice()))
    }

    fn has(&self, digest: &Digest) -> bool {
        self.index.contains_key(digest)
    }

    fn pin(&mut self, digest: &Digest) {
        self.pins.insert(*digest);
    }

    fn unpin(&mut self, digest: &Digest) {
        self.pins.remove(digest);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, DiskStore) {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().join("cas")).unwrap();
        (dir, store)
    }

    // ── 1. blob layout and round-trip ───────────────────────────────────

    #[test]
    fn put_writes_fanout_layout() {
        let (_dir, mut store) = open_store();
        let digest = store.put(b"layout test").unwrap();
        let hex = digest.to_hex();
        let expected = store.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex);
        assert!(expected.is_file());
        assert_eq!(&*store.get(&digest).unwrap(), b"layout test");
    }

    // ── 2. reopen rebuilds the index ────────────────────────────────────

    #[test]
    fn reopen_indexes_existing_blobs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cas");
        let digest = {
            let mut store = DiskStore::open(&root).unwrap();
            store.put(b"persist me").unwrap()
        };
        let reopened = DiskStore::open(&root).unwrap();
        assert!(reopened.has(&digest));
        assert_eq!(&*reopened.get(&digest).unwrap(), b"persist me");
        assert_eq!(reopened.byte_count(), b"persist me".len() as u64);
    }

    // ── 3. corrupt blob reads as absent ─────────────────────────────────

    #[test]
    fn corrupt_blob_degrades_to_miss() {
        let (_dir, mut store) = open_store();
        let digest = store.put(b"pristine").unwrap();
        let path = store.blob_path(&digest);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
        fs::write(&path, b"tampered").unwrap();
        assert!(store.get(&digest).is_none());
    }

    // ── 4. LRU eviction honors pins ─────────────────────────────────────

    #[test]
    fn eviction_is_lru_and_skips_pins() {
        let dir = TempDir::new().unwrap();
        let mut store = DiskStore::open_with_budget(dir.path().join("cas"), 24).unwrap();

        let a = store.put(b"aaaaaaaaaa").unwrap(); // 10 bytes
        let b = store.put(b"bbbbbbbbbb").unwrap(); // 10 bytes
        store.pin(&a);
        // Touch `a` is irrelevant — it is pinned; `b` is the LRU candidate.
        let c = store.put(b"cccccccccc").unwrap(); // 10 bytes, pushes over 24
        assert!(store.has(&a), "pinned blob must survive eviction");
        assert!(!store.has(&b), "unpinned LRU blob should be evicted");
        assert!(store.has(&c), "newly written blob should remain");
        assert!(store.byte_count() <= 24);
    }

    // ── 5. get refreshes recency ────────────────────────────────────────

    #[test]
    fn recency_follows_access_order() {
        let dir = TempDir::new().unwrap();
        let mut store = DiskStore::open_with_budget(dir.path().join("cas"), 24).unwrap();

        let a = store.put(b"aaaaaaaaaa").unwrap();
        let b = store.put(b"bbbbbbbbbb").unwrap();
        // Re-put `a` so `b` becomes least recently used.
        store.put(b"aaaaaaaaaa").unwrap();
        store.put(b"cccccccccc").unwrap();
        assert!(store.has(&a));
        assert!(!store.has(&b));
    }

    // ── 6. clear empties the tree ───────────────────────────────────────

    #[test]
    fn clear_removes_all_blobs() {
        let (_dir, mut store) = open_store();
        let digest = store.put(b"to be cleared").unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.byte_count(), 0);
        assert!(store.get(&digest).is_none());
    }
}
