// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content-addressed action cache for builder.
//!
//! The cache answers one question — *must this action actually run?* — and
//! makes a hit indistinguishable from an execution. It layers:
//!
//! - [`derive_action_id`] — the canonical BLAKE3 action key;
//! - [`FileStateTracker`] — two-tier change detection (metadata fast path,
//!   content-hash slow path);
//! - [`ActionRecord`] persistence — CBOR index log plus per-action files
//!   under `actions/`;
//! - the CAS itself (`builder-cas` [`DiskStore`]) under `cas/`;
//! - [`FlightMap`] — single-flight execution slots per action id.
//!
//! # Directory layout
//!
//! ```text
//! <cache_dir>/cas/<d[0:2]>/<d[2:4]>/<digest>   blob, mode 0o444
//! <cache_dir>/actions/index                    record log (replayed at open)
//! <cache_dir>/actions/<id[0:2]>/<id>           per-action record
//! <cache_dir>/state/files                      FileState journal
//! ```
//!
//! # Failure policy
//!
//! Cache errors never fail a build. Callers treat any [`CacheError`] from
//! `lookup`/`materialize` as a miss and recompute; `insert` failures are
//! logged and dropped. The one deliberate exception is
//! [`CacheError::MissingInput`], which reports a broken target declaration.
//!
//! # Clear contract
//!
//! [`ActionCache::clear_records`] is safe at any time: records are a pure
//! acceleration. Clearing the CAS alone would strand records whose outputs
//! no longer exist, so the only CAS-clearing operation is
//! [`ActionCache::clear_all`], which drops the records first.
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

mod error;
mod filestate;
mod flight;
mod key;
mod record;

pub use error::CacheError;
pub use filestate::{FileState, FileStateTracker, Freshness};
pub use flight::{Flight, FlightGuard, FlightMap};
pub use key::{derive_action_id, ActionId, ActionKeyInputs};
pub use record::ActionRecord;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use builder_cas::{digest_of, BlobStore, Digest, DiskStore};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// The persistent action cache shared by all workers of a build — and, via
/// the distributed layer, by remote workers too.
pub struct ActionCache {
    cas: Mutex<DiskStore>,
    records: Mutex<FxHashMap<ActionId, ActionRecord>>,
    files: FileStateTracker,
    flights: FlightMap<ActionRecord>,
    actions_dir: PathBuf,
    index_path: PathBuf,
    state_path: PathBuf,
}

impl std::fmt::Debug for ActionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionCache")
            .field("actions_dir", &self.actions_dir)
            .finish_non_exhaustive()
    }
}

impl ActionCache {
    /// Open (or create) the cache rooted at `cache_dir`.
    ///
    /// Replays the record index and the file-state journal; both tolerate
    /// damage by degrading to an empty state with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] only when the directory tree itself cannot
    /// be created or read.
    pub fn open(cache_dir: &Path) -> Result<Self, CacheError> {
        Self::open_inner(cache_dir, None)
    }

    /// Open with an enforced CAS byte budget (LRU eviction).
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_budget(cache_dir: &Path, max_bytes: u64) -> Result<Self, CacheError> {
        Self::open_inner(cache_dir, Some(max_bytes))
    }

    fn open_inner(cache_dir: &Path, budget: Option<u64>) -> Result<Self, CacheError> {
        let actions_dir = cache_dir.join("actions");
        let state_dir = cache_dir.join("state");
        fs::create_dir_all(&actions_dir)?;
        fs::create_dir_all(&state_dir)?;

        let cas = match budget {
            Some(max) => DiskStore::open_with_budget(cache_dir.join("cas"), max)?,
            None => DiskStore::open(cache_dir.join("cas"))?,
        };

        let index_path = actions_dir.join("index");
        let mut records = FxHashMap::default();
        match record::replay_index(&index_path) {
            Ok(replayed) => {
                for record in replayed {
                    // Later entries win: the log is append-only and an action
                    // may have been re-recorded after an eviction.
                    records.insert(record.action, record);
                }
            }
            Err(err) => warn!(error = %err, "record index unreadable, starting cold"),
        }

        let files = FileStateTracker::new();
        let state_path = state_dir.join("files");
        match load_file_state(&state_path) {
            Ok(states) => files.load(states),
            Err(err) => warn!(error = %err, "file-state journal unreadable, starting cold"),
        }

        Ok(Self {
            cas: Mutex::new(cas),
            records: Mutex::new(records),
            files,
            flights: FlightMap::new(),
            actions_dir,
            index_path,
            state_path,
        })
    }

    /// The file-state tracker for input change detection.
    pub fn files(&self) -> &FileStateTracker {
        &self.files
    }

    /// The single-flight map guarding concurrent executions per action id.
    pub fn flights(&self) -> &FlightMap<ActionRecord> {
        &self.flights
    }

    /// Number of records currently held.
    pub fn record_count(&self) -> usize {
        self.lock_records().len()
    }

    /// Look up a record and validate that every referenced output blob is
    /// still present. A record whose outputs were evicted is dropped and
    /// reported as a miss.
    pub fn lookup(&self, id: &ActionId) -> Option<ActionRecord> {
        let record = self.lock_records().get(id).cloned()?;
        let all_present = {
            let cas = self.lock_cas();
            record.outputs.iter().all(|(_, digest)| cas.has(digest))
        };
        if all_present {
            Some(record)
        } else {
            debug!(action = %id, "record outputs evicted, dropping record");
            self.lock_records().remove(id);
            None
        }
    }

    /// Commit an action's results: stage every output blob into the CAS,
    /// then persist and index the record. The record is only visible once
    /// all outputs are durable, so a crash can never produce a record whose
    /// outputs are missing.
    ///
    /// # Errors
    ///
    /// [`CacheError::MissingOutput`] if a declared output was not produced;
    /// [`CacheError::Io`]/[`CacheError::Cas`] for persistence failures. All
    /// are non-fatal to the build — the caller logs and moves on.
    pub fn insert(
        &self,
        id: ActionId,
        workspace_root: &Path,
        outputs: &[PathBuf],
        success: bool,
        exit_code: Option<i32>,
        stderr: &[u8],
        wall_ms: u64,
    ) -> Result<ActionRecord, CacheError> {
        let mut recorded_outputs = Vec::with_capacity(outputs.len());
        {
            let mut cas = self.lock_cas();
            for rel in outputs {
                let abs = workspace_root.join(rel);
                let bytes = match fs::read(&abs) {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        return Err(CacheError::MissingOutput { path: rel.clone() })
                    }
                    Err(err) => return Err(CacheError::Io(err)),
                };
                let digest = cas.put(&bytes)?;
                // Pin until the record commits so eviction cannot race us.
                cas.pin(&digest);
                recorded_outputs.push((rel.clone(), digest));
            }
            cas.put(stderr)?;
        }

        let record = ActionRecord {
            action: id,
            outputs: recorded_outputs,
            success,
            stderr: digest_of(stderr),
            exit_code,
            wall_ms,
        };

        let commit = record::write_action_file(&self.actions_dir, &record)
            .and_then(|()| record::append_to_index(&self.index_path, &record));
        {
            let mut cas = self.lock_cas();
            for (_, digest) in &record.outputs {
                cas.unpin(digest);
            }
        }
        commit?;

        self.lock_records().insert(id, record.clone());
        Ok(record)
    }

    /// Materialize a record's outputs from the CAS into `dest_root`.
    ///
    /// Returns `false` (a miss) if any blob has gone missing; partial writes
    /// are left in place and will be overwritten by the re-execution.
    ///
    /// # Errors
    ///
    /// [`CacheError::Io`] when an output file cannot be written.
    pub fn materialize(&self, record: &ActionRecord, dest_root: &Path) -> Result<bool, CacheError> {
        for (rel, digest) in &record.outputs {
            let bytes = {
                let cas = self.lock_cas();
                cas.get(digest)
            };
            let Some(bytes) = bytes else {
                debug!(action = %record.action, output = %rel.display(), "blob missing during materialize");
                return Ok(false);
            };
            let dest = dest_root.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &bytes)?;
        }
        Ok(true)
    }

    /// Pin a record's output blobs for the duration of a build session.
    pub fn pin_record(&self, record: &ActionRecord) {
        let mut cas = self.lock_cas();
        for (_, digest) in &record.outputs {
            cas.pin(digest);
        }
    }

    /// Drop a record's pins at session end.
    pub fn unpin_record(&self, record: &ActionRecord) {
        let mut cas = self.lock_cas();
        for (_, digest) in &record.outputs {
            cas.unpin(digest);
        }
    }

    /// Fetch a blob by digest (distributed `FetchBlob` service path).
    pub fn blob_get(&self, digest: &Digest) -> Option<Arc<[u8]>> {
        self.lock_cas().get(digest)
    }

    /// Store a blob with a known digest (distributed `PutBlob` service path).
    ///
    /// # Errors
    ///
    /// [`CacheError::Cas`] on digest mismatch or write failure.
    pub fn blob_put_verified(&self, expected: Digest, bytes: &[u8]) -> Result<(), CacheError> {
        self.lock_cas().put_verified(expected, bytes)?;
        Ok(())
    }

    /// Check blob presence without reading.
    pub fn blob_has(&self, digest: &Digest) -> bool {
        self.lock_cas().has(digest)
    }

    /// Persist the file-state journal (stage-then-rename).
    ///
    /// # Errors
    ///
    /// [`CacheError::Io`] when the journal cannot be written.
    pub fn persist_file_state(&self) -> Result<(), CacheError> {
        let snapshot = self.files.snapshot();
        let mut body = Vec::new();
        ciborium::ser::into_writer(&snapshot, &mut body).map_err(|err| CacheError::Corrupted {
            detail: format!("file-state encode: {err}"),
        })?;
        let stage = self.state_path.with_extension("stage");
        {
            let mut file = fs::File::create(&stage)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&stage, &self.state_path)?;
        Ok(())
    }

    /// Drop every action record (memory and disk). Always safe: records are
    /// an acceleration, the CAS remains intact.
    ///
    /// # Errors
    ///
    /// [`CacheError::Io`] when the on-disk records cannot be removed.
    pub fn clear_records(&self) -> Result<(), CacheError> {
        self.lock_records().clear();
        match fs::remove_dir_all(&self.actions_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(CacheError::Io(err)),
        }
        fs::create_dir_all(&self.actions_dir)?;
        Ok(())
    }

    /// Drop the records *and then* the CAS, in that order — the pairing that
    /// keeps the two stores consistent.
    ///
    /// # Errors
    ///
    /// [`CacheError::Io`] when on-disk state cannot be removed.
    pub fn clear_all(&self) -> Result<(), CacheError> {
        self.clear_records()?;
        self.lock_cas().clear()?;
        Ok(())
    }

    fn lock_cas(&self) -> std::sync::MutexGuard<'_, DiskStore> {
        self.cas.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, FxHashMap<ActionId, ActionRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn load_file_state(path: &Path) -> Result<Vec<(PathBuf, FileState)>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CacheError::Io(err)),
    };
    ciborium::de::from_reader(bytes.as_slice()).map_err(|err| CacheError::Corrupted {
        detail: format!("file-state decode: {err}"),
    })
}
