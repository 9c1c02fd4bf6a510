// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Whole-cache semantics: hit/miss behavior, eviction validation,
//! materialization, persistence across reopen, and the clear contract.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use builder_cache::{derive_action_id, ActionCache, ActionId, ActionKeyInputs};
use builder_cas::{digest_of, Digest};
use tempfile::TempDir;

fn sample_id(byte: u8) -> ActionId {
    ActionId(Digest([byte; 32]))
}

fn workspace_with_output(out_rel: &str, contents: &[u8]) -> TempDir {
    let ws = TempDir::new().unwrap();
    let out_abs = ws.path().join(out_rel);
    if let Some(parent) = out_abs.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(out_abs, contents).unwrap();
    ws
}

// ── insert → lookup → materialize round-trip ───────────────────────────

#[test]
fn insert_then_lookup_then_materialize() {
    let cache_dir = TempDir::new().unwrap();
    let ws = workspace_with_output("out/lib.a", b"archive bytes");
    let cache = ActionCache::open(cache_dir.path()).unwrap();

    let id = sample_id(1);
    let record = cache
        .insert(
            id,
            ws.path(),
            &[PathBuf::from("out/lib.a")],
            true,
            Some(0),
            b"",
            17,
        )
        .unwrap();
    assert!(record.success);
    assert_eq!(record.outputs.len(), 1);
    assert_eq!(record.outputs[0].1, digest_of(b"archive bytes"));

    let hit = cache.lookup(&id).expect("record just inserted");
    assert_eq!(hit, record);

    // Materialize into a fresh root: byte-identical content appears.
    let dest = TempDir::new().unwrap();
    assert!(cache.materialize(&hit, dest.path()).unwrap());
    assert_eq!(
        fs::read(dest.path().join("out/lib.a")).unwrap(),
        b"archive bytes"
    );
}

// ── property 4: success records guarantee outputs in CAS ───────────────

#[test]
fn successful_record_outputs_are_addressable() {
    let cache_dir = TempDir::new().unwrap();
    let ws = workspace_with_output("x.bin", b"payload");
    let cache = ActionCache::open(cache_dir.path()).unwrap();
    let record = cache
        .insert(sample_id(2), ws.path(), &[PathBuf::from("x.bin")], true, Some(0), b"", 1)
        .unwrap();
    for (_, digest) in &record.outputs {
        let blob = cache.blob_get(digest).expect("output addressable by digest");
        assert_eq!(&*blob, b"payload");
    }
}

// ── records persist across reopen ──────────────────────────────────────

#[test]
fn records_survive_reopen() {
    let cache_dir = TempDir::new().unwrap();
    let ws = workspace_with_output("out.txt", b"persisted");
    let id = sample_id(3);
    {
        let cache = ActionCache::open(cache_dir.path()).unwrap();
        cache
            .insert(id, ws.path(), &[PathBuf::from("out.txt")], true, Some(0), b"", 5)
            .unwrap();
    }
    let cache = ActionCache::open(cache_dir.path()).unwrap();
    let hit = cache.lookup(&id).expect("record replayed from index");
    assert_eq!(hit.outputs[0].1, digest_of(b"persisted"));
}

// ── missing output is reported, not silently recorded ──────────────────

#[test]
fn missing_output_is_an_error() {
    let cache_dir = TempDir::new().unwrap();
    let ws = TempDir::new().unwrap();
    let cache = ActionCache::open(cache_dir.path()).unwrap();
    let err = cache
        .insert(
            sample_id(4),
            ws.path(),
            &[PathBuf::from("never/made.o")],
            true,
            Some(0),
            b"",
            1,
        )
        .unwrap_err();
    assert!(err.to_string().contains("CACHE_MISSING_OUTPUT"));
    assert!(cache.lookup(&sample_id(4)).is_none(), "no record committed");
}

// ── eviction invalidates records on lookup ─────────────────────────────

#[test]
fn record_with_evicted_outputs_is_a_miss_and_dropped() {
    let cache_dir = TempDir::new().unwrap();
    let ws = workspace_with_output("big.bin", b"0123456789");
    let cache = ActionCache::open(cache_dir.path()).unwrap();
    let id = sample_id(5);
    cache
        .insert(id, ws.path(), &[PathBuf::from("big.bin")], true, Some(0), b"", 1)
        .unwrap();

    // Nuke the CAS behind the cache's back to simulate eviction.
    fs::remove_dir_all(cache_dir.path().join("cas")).unwrap();
    drop(cache);
    let cache = ActionCache::open(cache_dir.path()).unwrap();

    assert!(cache.lookup(&id).is_none(), "evicted outputs mean miss");
    assert!(cache.lookup(&id).is_none(), "record was dropped, stays miss");
}

// ── clear contract ─────────────────────────────────────────────────────

#[test]
fn clear_records_keeps_blobs_clear_all_drops_both() {
    let cache_dir = TempDir::new().unwrap();
    let ws = workspace_with_output("o.txt", b"blobbed");
    let cache = ActionCache::open(cache_dir.path()).unwrap();
    let id = sample_id(6);
    let record = cache
        .insert(id, ws.path(), &[PathBuf::from("o.txt")], true, Some(0), b"", 1)
        .unwrap();
    let digest = record.outputs[0].1;

    cache.clear_records().unwrap();
    assert!(cache.lookup(&id).is_none());
    assert!(cache.blob_has(&digest), "clear_records leaves the CAS intact");

    cache.clear_all().unwrap();
    assert!(!cache.blob_has(&digest), "clear_all drops the CAS too");
}

// ── action key ties into file probing ──────────────────────────────────

#[test]
fn file_probe_feeds_a_stable_action_key() {
    let ws = workspace_with_output("src/main.c", b"int main(){}");
    let cache_dir = TempDir::new().unwrap();
    let cache = ActionCache::open(cache_dir.path()).unwrap();

    let (digest, _) = cache
        .files()
        .probe(ws.path(), Path::new("src/main.c"))
        .unwrap();
    let argv = vec!["-c".to_owned(), "src/main.c".to_owned()];
    let env = BTreeMap::new();
    let inputs = vec![(PathBuf::from("src/main.c"), digest)];
    let outputs = vec![PathBuf::from("main.o")];
    let key = ActionKeyInputs {
        tool_digest: digest_of(b"cc"),
        argv: &argv,
        env: &env,
        inputs: &inputs,
        outputs: &outputs,
    };
    let first = derive_action_id(&key);

    // A second probe fast-paths but must produce the identical key.
    let (digest2, _) = cache
        .files()
        .probe(ws.path(), Path::new("src/main.c"))
        .unwrap();
    assert_eq!(digest, digest2);
    let inputs2 = vec![(PathBuf::from("src/main.c"), digest2)];
    let key2 = ActionKeyInputs { inputs: &inputs2, ..key.clone() };
    assert_eq!(first, derive_action_id(&key2));
}
