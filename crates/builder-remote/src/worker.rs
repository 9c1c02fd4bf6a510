// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The remote worker: pulls inputs by digest, executes hermetically in a
//! scratch workspace, pushes output blobs, reports results.
//!
//! Workers are stateless between actions — every execution stages a fresh
//! workspace from CAS blobs, so any worker can run any action (content
//! addressing makes every blob source equivalent). Inputs are fetched
//! lazily: only digests missing from the local staging set travel the wire.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use builder_cache::ActionId;
use builder_cas::{digest_of, Digest};
use builder_proto::{encode_message, Message, WireMetrics, WorkerId};
use builder_sandbox::{CancellationToken, HermeticExecutor, SandboxSpec, Strategy};
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::conn::{read_message, spawn_writer, FrameSender};
use crate::RemoteError;

/// Worker tuning.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Parallel actions this worker accepts.
    pub capacity: u32,
    /// Heartbeat period (must match the coordinator's expectation).
    pub heartbeat: Duration,
    /// SIGTERM → SIGKILL grace for aborted actions.
    pub grace: Duration,
    /// Per-blob fetch deadline.
    pub blob_timeout: Duration,
    /// Force a sandbox strategy (tests pin [`Strategy::Fallback`]).
    pub strategy: Option<Strategy>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            heartbeat: Duration::from_secs(2),
            grace: Duration::from_secs(5),
            blob_timeout: Duration::from_secs(10),
            strategy: None,
        }
    }
}

/// Tasks belonging to one worker session, abortable as a unit.
type TaskSet = Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>;

/// Handle to a running worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    tasks: TaskSet,
}

impl WorkerHandle {
    /// The worker's wire identity.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Tear the whole worker down — read loop, heartbeats, and in-flight
    /// executions. Used by tests to simulate a crash; the dropped write half
    /// closes the connection so the coordinator requeues outstanding work.
    pub fn abort(&self) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for task in tasks.iter() {
            task.abort();
        }
    }
}

/// Requests awaiting correlated replies (blob fetches).
type ReplyMap = Arc<Mutex<FxHashMap<u64, oneshot::Sender<Message>>>>;

/// Connect to a coordinator and serve actions until aborted.
///
/// # Errors
///
/// [`RemoteError::Io`] when the coordinator cannot be reached.
pub async fn run_worker(addr: &str, config: WorkerConfig) -> Result<WorkerHandle, RemoteError> {
    let stream = TcpStream::connect(addr).await?;
    let id = WorkerId(rand::random());
    let (mut read, write) = stream.into_split();
    let tx = spawn_writer(write);

    let correlation = Arc::new(AtomicU64::new(1));
    let replies: ReplyMap = Arc::new(Mutex::new(FxHashMap::default()));
    let inflight = Arc::new(AtomicUsize::new(0));
    let aborts: Arc<Mutex<FxHashMap<ActionId, CancellationToken>>> =
        Arc::new(Mutex::new(FxHashMap::default()));
    let tasks: TaskSet = Arc::new(Mutex::new(Vec::new()));

    tx.send(encode_message(
        &Message::Hello {
            worker: id,
            capacity: config.capacity,
        },
        0,
    ))
    .map_err(|_| RemoteError::WorkerUnreachable(id))?;

    // Heartbeats carry queue depth and a load EMA over utilization.
    let hb_tx = tx.clone();
    let hb_inflight = Arc::clone(&inflight);
    let heartbeat = tokio::spawn(async move {
        let mut load = 0.0f64;
        let mut ticker = tokio::time::interval(config.heartbeat);
        loop {
            ticker.tick().await;
            let depth = hb_inflight.load(Ordering::Acquire);
            #[allow(clippy::cast_precision_loss)]
            let sample = depth as f64 / f64::from(config.capacity.max(1));
            load = 0.3 * sample + 0.7 * load;
            let frame = encode_message(
                &Message::Heartbeat {
                    worker: id,
                    queue_depth: u32::try_from(depth).unwrap_or(u32::MAX),
                    load,
                },
                0,
            );
            if hb_tx.send(frame).is_err() {
                return;
            }
        }
    });
    tasks
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(heartbeat);

    let loop_tasks = Arc::clone(&tasks);
    let task = tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            let message = match read_message(&mut read, &mut buf).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!(worker = %id, "coordinator connection closed");
                    break;
                }
                Err(err) => {
                    warn!(worker = %id, error = %err, "protocol error, disconnecting");
                    break;
                }
            };
            dispatch_incoming(
                message,
                id,
                &tx,
                &correlation,
                &replies,
                &inflight,
                &aborts,
                &loop_tasks,
                config,
            );
        }
    });
    tasks
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(task);

    Ok(WorkerHandle { id, tasks })
}

#[allow(clippy::too_many_arguments)]
fn dispatch_incoming(
    (message, correlation_in): (Message, u64),
    id: WorkerId,
    tx: &FrameSender,
    correlation: &Arc<AtomicU64>,
    replies: &ReplyMap,
    inflight: &Arc<AtomicUsize>,
    aborts: &Arc<Mutex<FxHashMap<ActionId, CancellationToken>>>,
    tasks: &TaskSet,
    config: WorkerConfig,
) {
    match message {
        Message::Enqueue {
            action,
            command,
            spec,
            input_digests,
        } => {
            debug!(worker = %id, action = %action, "action received");
            let token = CancellationToken::new();
            aborts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(action, token.clone());
            inflight.fetch_add(1, Ordering::AcqRel);

            let tx = tx.clone();
            let correlation = Arc::clone(correlation);
            let replies = Arc::clone(replies);
            let inflight = Arc::clone(inflight);
            let aborts = Arc::clone(aborts);
            let exec_task = tokio::spawn(async move {
                let result = execute_action(
                    action,
                    command.tool,
                    command.argv,
                    command.env,
                    spec,
                    input_digests,
                    &tx,
                    &correlation,
                    &replies,
                    token,
                    config,
                )
                .await;
                inflight.fetch_sub(1, Ordering::AcqRel);
                aborts
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&action);
                match result {
                    Ok(frame) => {
                        let _ = tx.send(frame);
                    }
                    Err(err) => {
                        warn!(action = %action, error = %err, "remote action failed locally");
                        let _ = tx.send(encode_message(
                            &Message::Error {
                                code: 500,
                                message: err.to_string(),
                            },
                            0,
                        ));
                    }
                }
            });
            tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(exec_task);
        }
        Message::AbortAction { action } => {
            if let Some(token) = aborts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&action)
            {
                token.cancel();
            }
            let _ = tx.send(encode_message(&Message::Ack, correlation_in));
        }
        Message::PutBlob { .. } | Message::Ack | Message::Error { .. } => {
            // Correlated reply to one of our requests.
            let waiter = replies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&correlation_in);
            if let Some(waiter) = waiter {
                let _ = waiter.send(message);
            }
        }
        other => {
            debug!(worker = %id, opcode = other.opcode(), "unexpected frame, ignoring");
        }
    }
}

/// Fetch a blob by digest over the connection.
async fn fetch_blob(
    digest: Digest,
    tx: &FrameSender,
    correlation: &Arc<AtomicU64>,
    replies: &ReplyMap,
    timeout: Duration,
) -> Result<Vec<u8>, RemoteError> {
    let corr = correlation.fetch_add(1, Ordering::AcqRel);
    let (reply_tx, reply_rx) = oneshot::channel();
    replies
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(corr, reply_tx);
    tx.send(encode_message(&Message::FetchBlob { digest }, corr))
        .map_err(|_| RemoteError::BlobMissing(digest))?;

    let reply = tokio::time::timeout(timeout, reply_rx)
        .await
        .map_err(|_| RemoteError::Timeout {
            class: "blob-fetch",
            ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })?
        .map_err(|_| RemoteError::BlobMissing(digest))?;

    match reply {
        Message::PutBlob {
            digest: got,
            bytes,
        } if got == digest && digest_of(&bytes) == digest => Ok(bytes),
        _ => Err(RemoteError::BlobMissing(digest)),
    }
}

/// Stage, execute, push outputs, and build the result frame.
#[allow(clippy::too_many_arguments)]
async fn execute_action(
    action: ActionId,
    tool: PathBuf,
    argv: Vec<String>,
    _env: BTreeMap<String, String>,
    spec: SandboxSpec,
    input_digests: Vec<(PathBuf, Digest)>,
    tx: &FrameSender,
    correlation: &Arc<AtomicU64>,
    replies: &ReplyMap,
    token: CancellationToken,
    config: WorkerConfig,
) -> Result<Vec<u8>, RemoteError> {
    // Pull inputs lazily and stage a scratch workspace.
    let scratch = tempfile::TempDir::new()?;
    for (rel, digest) in &input_digests {
        let bytes = fetch_blob(*digest, tx, correlation, replies, config.blob_timeout).await?;
        let dest = scratch.path().join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, bytes)?;
    }

    // The execution itself is blocking; hand it to the blocking pool.
    let root = scratch.path().to_path_buf();
    let exec_spec = spec;
    let outcome = tokio::task::spawn_blocking(move || {
        let executor = match config.strategy {
            Some(strategy) => HermeticExecutor::with_strategy(&root, config.grace, strategy),
            None => HermeticExecutor::new(&root, config.grace),
        };
        executor.run(&tool, &argv, &exec_spec, &token)
    })
    .await
    .map_err(|_| RemoteError::Aborted)?;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(builder_sandbox::ExecError::Cancelled) => return Err(RemoteError::Aborted),
        Err(err) => {
            // Infrastructure failure on this worker; the coordinator will
            // retry elsewhere.
            return Ok(encode_message(
                &Message::Error {
                    code: 500,
                    message: err.to_string(),
                },
                0,
            ));
        }
    };

    // Push every output blob before the result, so a committed result
    // implies available outputs.
    for (rel, digest) in &outcome.output_digests {
        let bytes = std::fs::read(scratch.path().join(rel))?;
        let corr = correlation.fetch_add(1, Ordering::AcqRel);
        let (reply_tx, reply_rx) = oneshot::channel();
        replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(corr, reply_tx);
        tx.send(encode_message(
            &Message::PutBlob {
                digest: *digest,
                bytes,
            },
            corr,
        ))
        .map_err(|_| RemoteError::BlobMissing(*digest))?;
        let _ = tokio::time::timeout(config.blob_timeout, reply_rx).await;
    }

    let stderr_digest = digest_of(&outcome.stderr);
    Ok(encode_message(
        &Message::ActionResult {
            action,
            outputs: outcome.output_digests.clone(),
            exit: outcome.exit_code,
            stderr_digest,
            metrics: WireMetrics {
                wall_ms: u64::try_from(outcome.usage.wall.as_millis()).unwrap_or(u64::MAX),
                peak_memory_bytes: outcome.usage.peak_memory_bytes,
                cpu_ms: outcome.usage.cpu_ms,
            },
        },
        0,
    ))
}
