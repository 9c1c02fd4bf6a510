// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted action records.
//!
//! One [`ActionRecord`] per completed action, keyed by [`ActionId`]. Records
//! are CBOR-encoded (deterministic, schema via serde derive) and persisted
//! twice: appended to the `actions/index` log for fast replay at open, and
//! written standalone under `actions/<id[0:2]>/<id>` as the authoritative
//! copy. A record is only committed after every referenced output blob is
//! durable in the CAS — a record therefore *guarantees* its outputs exist.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use builder_cas::Digest;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ActionId, CacheError};

/// Result of one executed action, sufficient to replay its effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// The action this record belongs to.
    pub action: ActionId,
    /// Output path → blob digest, in declared order.
    pub outputs: Vec<(PathBuf, Digest)>,
    /// Whether the action exited successfully.
    pub success: bool,
    /// Digest of captured stderr (empty digest for silent actions).
    pub stderr: Digest,
    /// Exit code of the underlying command, if it ran to completion.
    pub exit_code: Option<i32>,
    /// Wall time of the execution in milliseconds.
    pub wall_ms: u64,
}

/// Encode a record as CBOR bytes.
pub(crate) fn encode_record(record: &ActionRecord) -> Result<Vec<u8>, CacheError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(record, &mut out).map_err(|err| CacheError::Corrupted {
        detail: format!("record encode: {err}"),
    })?;
    Ok(out)
}

/// Decode a record from CBOR bytes.
pub(crate) fn decode_record(bytes: &[u8]) -> Result<ActionRecord, CacheError> {
    ciborium::de::from_reader(bytes).map_err(|err| CacheError::Corrupted {
        detail: format!("record decode: {err}"),
    })
}

/// Append a length-prefixed record entry to the index log.
pub(crate) fn append_to_index(index_path: &Path, record: &ActionRecord) -> Result<(), CacheError> {
    let body = encode_record(record)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(index_path)?;
    let mut entry = Vec::with_capacity(4 + body.len());
    entry.extend_from_slice(&(body.len() as u32).to_le_bytes());
    entry.extend_from_slice(&body);
    // Single write so a torn append can only damage the log tail.
    file.write_all(&entry)?;
    file.sync_all()?;
    Ok(())
}

/// Replay the index log. A damaged tail is tolerated (warn and stop); damage
/// in the middle means the log is discarded — the per-action files remain and
/// affected actions simply miss.
pub(crate) fn replay_index(index_path: &Path) -> Result<Vec<ActionRecord>, CacheError> {
    let bytes = match fs::read(index_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CacheError::Io(err)),
    };
    let mut records = Vec::new();
    let mut cursor = &bytes[..];
    while cursor.len() >= 4 {
        let mut len_buf = [0u8; 4];
        // Reads from a slice cannot fail; keep the io plumbing honest anyway.
        cursor.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if cursor.len() < len {
            warn!(path = %index_path.display(), "truncated record at index tail, ignoring");
            break;
        }
        match decode_record(&cursor[..len]) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(path = %index_path.display(), error = %err, "undecodable index entry, stopping replay");
                break;
            }
        }
        cursor = &cursor[len..];
    }
    if !cursor.is_empty() && cursor.len() < 4 {
        warn!(path = %index_path.display(), "trailing garbage at index tail, ignoring");
    }
    Ok(records)
}

/// Write the standalone per-action record via stage-then-rename.
pub(crate) fn write_action_file(actions_dir: &Path, record: &ActionRecord) -> Result<(), CacheError> {
    let hex = record.action.to_hex();
    let dir = actions_dir.join(&hex[0..2]);
    fs::create_dir_all(&dir)?;
    let final_path = dir.join(&hex);
    let stage_path = dir.join(format!(".stage-{hex}"));
    let body = encode_record(record)?;
    {
        let mut file = fs::File::create(&stage_path)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&stage_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use builder_cas::digest_of;
    use tempfile::TempDir;

    fn sample(id_byte: u8) -> ActionRecord {
        ActionRecord {
            action: ActionId(Digest([id_byte; 32])),
            outputs: vec![(PathBuf::from("out/lib.a"), digest_of(b"archive"))],
            success: true,
            stderr: digest_of(b""),
            exit_code: Some(0),
            wall_ms: 42,
        }
    }

    // ── serialize → deserialize is identity ─────────────────────────────

    #[test]
    fn record_round_trip_is_identity() {
        let record = sample(1);
        let bytes = encode_record(&record).unwrap();
        let back = decode_record(&bytes).unwrap();
        assert_eq!(record, back);
    }

    // ── index replay preserves order and tolerates torn tails ───────────

    #[test]
    fn index_replays_in_append_order() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("index");
        for byte in 1..=3u8 {
            append_to_index(&index, &sample(byte)).unwrap();
        }
        let records = replay_index(&index).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].action, ActionId(Digest([1; 32])));
        assert_eq!(records[2].action, ActionId(Digest([3; 32])));
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("index");
        append_to_index(&index, &sample(7)).unwrap();
        // Simulate a crash mid-append: length prefix promising more than is
        // there.
        let mut file = fs::OpenOptions::new().append(true).open(&index).unwrap();
        file.write_all(&[0xFF, 0x00, 0x00, 0x00, 0x01]).unwrap();
        drop(file);
        let records = replay_index(&index).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn missing_index_is_empty_not_error() {
        let dir = TempDir::new().unwrap();
        let records = replay_index(&dir.path().join("nope")).unwrap();
        assert!(records.is_empty());
    }

    // ── standalone record files land under the fan-out dir ──────────────

    #[test]
    fn action_file_lands_in_fanout_layout() {
        let dir = TempDir::new().unwrap();
        let record = sample(0xAB);
        write_action_file(dir.path(), &record).unwrap();
        let hex = record.action.to_hex();
        let path = dir.path().join(&hex[0..2]).join(&hex);
        assert!(path.is_file());
        let back = decode_record(&fs::read(path).unwrap()).unwrap();
        assert_eq!(back, record);
    }
}
