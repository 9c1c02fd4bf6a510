// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Coordinator/worker integration over localhost TCP: blob pull, remote
//! execution, result commit, duplicate dedup, and worker-loss re-enqueue.
#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use builder_cache::{ActionCache, ActionId};
use builder_cas::{digest_of, Digest};
use builder_proto::WireCommand;
use builder_remote::{run_worker, Coordinator, DispatchRequest, RemoteConfig, WorkerConfig};
use builder_sandbox::{SandboxSpec, Strategy};
use tempfile::TempDir;

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        capacity: 2,
        heartbeat: Duration::from_millis(200),
        grace: Duration::from_millis(200),
        blob_timeout: Duration::from_secs(5),
        strategy: Some(Strategy::Fallback),
    }
}

fn remote_config() -> RemoteConfig {
    RemoteConfig {
        heartbeat: Duration::from_millis(200),
        heartbeat_grace: 3,
        action_timeout: Duration::from_secs(10),
        retry_budget: 3,
    }
}

fn sh_request(action_byte: u8, script: &str, inputs: Vec<(PathBuf, Digest)>) -> DispatchRequest {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_owned(), "/usr/bin:/bin".to_owned());
    let mut spec = SandboxSpec::builder()
        .output("out.txt")
        .env("PATH", "/usr/bin:/bin");
    for (path, _) in &inputs {
        spec = spec.input(path.clone());
    }
    DispatchRequest {
        action: ActionId(Digest([action_byte; 32])),
        command: WireCommand {
            tool: PathBuf::from("/bin/sh"),
            argv: vec!["-c".to_owned(), script.to_owned()],
            env,
        },
        spec: spec.build().unwrap(),
        input_digests: inputs,
    }
}

async fn wait_for_workers(coordinator: &Coordinator, count: usize) {
    for _ in 0..100 {
        if coordinator.worker_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workers never registered");
}

// ── scenario: dispatch, blob pull, result, output blobs in CAS ─────────

#[tokio::test(flavor = "multi_thread")]
async fn remote_action_round_trip() {
    let cache_dir = TempDir::new().unwrap();
    let cache = Arc::new(ActionCache::open(cache_dir.path()).unwrap());

    // Seed the input blob coordinator-side; the worker must pull it.
    let input = b"remote input bytes";
    let input_digest = digest_of(input);
    cache.blob_put_verified(input_digest, input).unwrap();

    let coordinator = Coordinator::bind("127.0.0.1:0", Arc::clone(&cache), remote_config())
        .await
        .unwrap();
    let addr = coordinator.local_addr().to_string();
    let worker = run_worker(&addr, worker_config()).await.unwrap();
    wait_for_workers(&coordinator, 1).await;

    let request = sh_request(
        1,
        "tr a-z A-Z < in.txt > out.txt",
        vec![(PathBuf::from("in.txt"), input_digest)],
    );
    let outcome = coordinator.submit(request).await.unwrap();

    assert_eq!(outcome.exit, 0);
    assert_eq!(outcome.outputs.len(), 1);
    let (path, digest) = &outcome.outputs[0];
    assert_eq!(path, &PathBuf::from("out.txt"));
    let blob = cache
        .blob_get(digest)
        .expect("output blob pushed into coordinator CAS");
    assert_eq!(&*blob, b"REMOTE INPUT BYTES");

    worker.abort();
    coordinator.shutdown();
}

// ── scenario 6 (tail): duplicate completion dedupes by ActionId ────────

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_submission_returns_the_committed_result() {
    let cache_dir = TempDir::new().unwrap();
    let cache = Arc::new(ActionCache::open(cache_dir.path()).unwrap());
    let coordinator = Coordinator::bind("127.0.0.1:0", Arc::clone(&cache), remote_config())
        .await
        .unwrap();
    let addr = coordinator.local_addr().to_string();
    let worker = run_worker(&addr, worker_config()).await.unwrap();
    wait_for_workers(&coordinator, 1).await;

    let first = coordinator
        .submit(sh_request(2, "echo once > out.txt", vec![]))
        .await
        .unwrap();

    // Same ActionId again: served from the completed set, not re-executed.
    let started = std::time::Instant::now();
    let second = coordinator
        .submit(sh_request(2, "echo once > out.txt", vec![]))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100), "dedup is immediate");
    assert_eq!(first.outputs, second.outputs);

    worker.abort();
    coordinator.shutdown();
}

// ── scenario 6: worker dies mid-action, work re-enqueues elsewhere ─────

#[tokio::test(flavor = "multi_thread")]
async fn worker_loss_reenqueues_outstanding_actions() {
    let cache_dir = TempDir::new().unwrap();
    let cache = Arc::new(ActionCache::open(cache_dir.path()).unwrap());
    let coordinator = Coordinator::bind("127.0.0.1:0", Arc::clone(&cache), remote_config())
        .await
        .unwrap();
    let addr = coordinator.local_addr().to_string();

    // One worker takes the action, then "crashes".
    let coordinator = Arc::new(coordinator);
    let doomed = run_worker(&addr, worker_config()).await.unwrap();
    wait_for_workers(&coordinator, 1).await;

    let submit = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        let request = sh_request(3, "sleep 1; echo survived > out.txt", vec![]);
        async move { coordinator.submit(request).await }
    });

    // Give the dispatch a moment to land on the doomed worker, then kill it
    // and bring up a replacement.
    tokio::time::sleep(Duration::from_millis(300)).await;
    doomed.abort();
    let replacement = run_worker(&addr, worker_config()).await.unwrap();

    let outcome = submit.await.unwrap().unwrap();
    assert_eq!(outcome.exit, 0);
    let (_, digest) = &outcome.outputs[0];
    assert_eq!(&*cache.blob_get(digest).unwrap(), b"survived\n");

    replacement.abort();
}
