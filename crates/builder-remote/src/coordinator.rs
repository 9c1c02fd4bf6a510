// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The coordinator: accepts workers, dispatches actions least-loaded-first,
//! serves CAS blobs, and re-enqueues work lost to dead workers.
//!
//! Single-flight across the fleet holds at the `ActionId` level: a late
//! duplicate completion (possible after a heartbeat-lapse re-enqueue) is
//! deduplicated against the completed-set, so exactly one result persists.
//! Every outbound dispatch passes the destination's circuit breaker and
//! token bucket; a tripped breaker shrinks the bucket so pressure backs off
//! together with trust.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use builder_cache::{ActionCache, ActionId};
use builder_cas::Digest;
use builder_proto::{encode_message, Message, WireCommand, WireMetrics, WorkerId};
use builder_sandbox::SandboxSpec;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::conn::{read_message, spawn_writer, FrameSender};
use crate::predictor::{LoadPredictor, PredictorConfig, ScaleDecision};
use crate::ratelimit::TokenBucket;
use crate::RemoteError;

/// Tuning for the distributed layer.
#[derive(Debug, Clone, Copy)]
pub struct RemoteConfig {
    /// Worker heartbeat period.
    pub heartbeat: Duration,
    /// Heartbeats a worker may miss before it is declared dead.
    pub heartbeat_grace: u32,
    /// Deadline for one dispatched action attempt.
    pub action_timeout: Duration,
    /// Transparent retries for network-lost actions.
    pub retry_budget: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(2),
            heartbeat_grace: 3,
            action_timeout: Duration::from_secs(30),
            retry_budget: 3,
        }
    }
}

/// One action handed to [`Coordinator::submit`].
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// The action key.
    pub action: ActionId,
    /// What to run.
    pub command: WireCommand,
    /// What it may touch.
    pub spec: SandboxSpec,
    /// Input digests the worker pulls lazily.
    pub input_digests: Vec<(PathBuf, Digest)>,
}

/// A completed remote action.
#[derive(Debug, Clone)]
pub struct RemoteOutcome {
    /// The action key.
    pub action: ActionId,
    /// Exit code reported by the worker.
    pub exit: i32,
    /// Output path → digest pairs (blobs already in the coordinator CAS).
    pub outputs: Vec<(PathBuf, Digest)>,
    /// Digest of captured stderr.
    pub stderr_digest: Digest,
    /// Worker-side execution metrics.
    pub metrics: WireMetrics,
}

struct WorkerConn {
    tx: FrameSender,
    capacity: u32,
    queue_depth: u32,
    load: f64,
    last_seen: Instant,
    outstanding: FxHashMap<ActionId, DispatchRequest>,
    breaker: CircuitBreaker,
    bucket: TokenBucket,
}

#[derive(Default)]
struct State {
    workers: FxHashMap<WorkerId, WorkerConn>,
    queue: VecDeque<DispatchRequest>,
    completed: FxHashMap<ActionId, RemoteOutcome>,
    waiters: FxHashMap<ActionId, Vec<oneshot::Sender<RemoteOutcome>>>,
    next_correlation: u64,
}

/// The coordinator endpoint.
pub struct Coordinator {
    state: Arc<Mutex<State>>,
    cache: Arc<ActionCache>,
    config: RemoteConfig,
    local_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Coordinator {
    /// Bind and start accepting workers.
    ///
    /// # Errors
    ///
    /// [`RemoteError::Io`] when the listener cannot bind.
    pub async fn bind(
        addr: &str,
        cache: Arc<ActionCache>,
        config: RemoteConfig,
    ) -> Result<Self, RemoteError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = Arc::clone(&state);
        let accept_cache = Arc::clone(&cache);
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "worker connection accepted");
                        let state = Arc::clone(&accept_state);
                        let cache = Arc::clone(&accept_cache);
                        tokio::spawn(connection_task(stream, state, cache));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        return;
                    }
                }
            }
        });

        let reaper_state = Arc::clone(&state);
        let reaper = tokio::spawn(reaper_task(reaper_state, config));

        Ok(Self {
            state,
            cache,
            config,
            local_addr,
            tasks: vec![accept, reaper],
        })
    }

    /// Address the coordinator is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registered, live workers.
    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Dispatch an action to the fleet and await its result.
    ///
    /// Duplicate submissions of an already-completed `ActionId` return the
    /// recorded outcome without re-executing anything.
    ///
    /// # Errors
    ///
    /// [`RemoteError::Timeout`] after the retry budget is exhausted;
    /// [`RemoteError::NoWorkers`] when the fleet is empty.
    pub async fn submit(&self, request: DispatchRequest) -> Result<RemoteOutcome, RemoteError> {
        let action = request.action;
        for attempt in 0..=self.config.retry_budget {
            let rx = {
                let mut state = self.lock();
                if let Some(done) = state.completed.get(&action) {
                    return Ok(done.clone());
                }
                if state.workers.is_empty() {
                    return Err(RemoteError::NoWorkers);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(action).or_default().push(tx);
                state.queue.push_back(request.clone());
                try_dispatch(&mut state);
                rx
            };

            match tokio::time::timeout(self.config.action_timeout, rx).await {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(_)) | Err(_) => {
                    // Lost or timed out; back off with jitter and requeue.
                    let backoff = Duration::from_millis(
                        50u64.saturating_mul(1 << attempt.min(6))
                            + u64::from(rand::random::<u8>()),
                    );
                    debug!(action = %action, attempt, ?backoff, "action attempt lost, retrying");
                    self.forget_assignment(action);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(RemoteError::Timeout {
            class: "action",
            ms: u64::try_from(self.config.action_timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Abort an in-flight action: the holding worker gets an `AbortAction`
    /// frame and the local bookkeeping is dropped. Waiters observe the abort
    /// as a timeout. Workers that never acknowledge are abandoned to the
    /// heartbeat reaper.
    pub fn abort(&self, action: ActionId) {
        let mut state = self.lock();
        state.queue.retain(|p| p.action != action);
        let correlation = state.next_correlation;
        state.next_correlation += 1;
        for worker in state.workers.values_mut() {
            if worker.outstanding.remove(&action).is_some() {
                let _ = worker
                    .tx
                    .send(encode_message(&Message::AbortAction { action }, correlation));
            }
        }
        state.waiters.remove(&action);
    }

    /// Drop stale assignment bookkeeping for a re-submitted action.
    fn forget_assignment(&self, action: ActionId) {
        let mut state = self.lock();
        state.queue.retain(|p| p.action != action);
        for worker in state.workers.values_mut() {
            worker.outstanding.remove(&action);
        }
        state.waiters.remove(&action);
    }

    /// The coordinator's CAS handle (blobs arrive here from workers).
    pub fn cache(&self) -> &Arc<ActionCache> {
        &self.cache
    }

    /// Stop all background tasks.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Dispatch queued actions to the least-loaded willing worker.
fn try_dispatch(state: &mut State) {
    while let Some(request) = state.queue.pop_front() {
        // Least-loaded: fewest in-flight relative to capacity, then lowest
        // reported load EMA.
        let mut candidates: Vec<WorkerId> = state.workers.keys().copied().collect();
        candidates.sort_by(|a, b| {
            let wa = &state.workers[a];
            let wb = &state.workers[b];
            let fill_a = wa.outstanding.len() + wa.queue_depth as usize;
            let fill_b = wb.outstanding.len() + wb.queue_depth as usize;
            fill_a
                .cmp(&fill_b)
                .then_with(|| wa.load.partial_cmp(&wb.load).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut dispatched = false;
        for id in candidates {
            let correlation = state.next_correlation;
            let Some(worker) = state.workers.get_mut(&id) else {
                continue;
            };
            if !worker.breaker.allow() {
                continue;
            }
            if !worker.bucket.try_acquire() {
                worker.breaker.record_success(); // not the breaker's fault
                continue;
            }
            state.next_correlation += 1;
            let frame = encode_message(
                &Message::Enqueue {
                    action: request.action,
                    command: request.command.clone(),
                    spec: request.spec.clone(),
                    input_digests: request.input_digests.clone(),
                },
                correlation,
            );
            if worker.tx.send(frame).is_ok() {
                worker.outstanding.insert(request.action, request.clone());
                debug!(action = %request.action, worker = %id, "action dispatched");
                dispatched = true;
                break;
            }
            worker.breaker.record_failure();
        }

        if !dispatched {
            state.queue.push_front(request);
            return;
        }
    }
}

/// Reap workers whose heartbeat lapsed and requeue their outstanding work.
async fn reaper_task(state: Arc<Mutex<State>>, config: RemoteConfig) {
    let deadline = config.heartbeat * config.heartbeat_grace;
    let mut predictor = LoadPredictor::new(PredictorConfig::default());
    let mut ticker = tokio::time::interval(config.heartbeat);
    loop {
        ticker.tick().await;
        let mut state = state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let dead: Vec<WorkerId> = state
            .workers
            .iter()
            .filter(|(_, w)| w.last_seen.elapsed() > deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(worker) = state.workers.remove(&id) {
                warn!(worker = %id, outstanding = worker.outstanding.len(), "heartbeat lapsed, requeueing");
                for (_, request) in worker.outstanding {
                    state.queue.push_front(request);
                }
            }
        }
        if !state.queue.is_empty() {
            try_dispatch(&mut state);
        }

        // Fleet utilization feeds the autoscaling predictor; it only ever
        // recommends.
        let capacity: u32 = state.workers.values().map(|w| w.capacity.max(1)).sum();
        if capacity > 0 {
            let inflight: usize = state.workers.values().map(|w| w.outstanding.len()).sum();
            #[allow(clippy::cast_precision_loss)]
            let utilization = inflight as f64 / f64::from(capacity);
            match predictor.observe(utilization) {
                ScaleDecision::Up => info!(utilization, "autoscaler recommends scale-up"),
                ScaleDecision::Down => info!(utilization, "autoscaler recommends scale-down"),
                ScaleDecision::Hold => {}
            }
        }
    }
}

/// Per-connection read loop.
async fn connection_task(
    stream: tokio::net::TcpStream,
    state: Arc<Mutex<State>>,
    cache: Arc<ActionCache>,
) {
    let (mut read, write) = stream.into_split();
    let tx = spawn_writer(write);
    let mut buf = Vec::new();
    let mut registered: Option<WorkerId> = None;

    loop {
        let message = match read_message(&mut read, &mut buf).await {
            Ok(Some((message, correlation))) => (message, correlation),
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "protocol error from worker, closing");
                let frame = encode_message(
                    &Message::Error {
                        code: 1,
                        message: err.to_string(),
                    },
                    0,
                );
                let _ = tx.send(frame);
                break;
            }
        };
        handle_message(message, &tx, &state, &cache, &mut registered);
    }

    // Connection gone: requeue everything the worker still owed us.
    if let Some(id) = registered {
        let mut state = state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(worker) = state.workers.remove(&id) {
            warn!(worker = %id, "worker disconnected, requeueing outstanding actions");
            for (_, request) in worker.outstanding {
                state.queue.push_front(request);
            }
            try_dispatch(&mut state);
        }
    }
}

fn handle_message(
    (message, correlation): (Message, u64),
    tx: &FrameSender,
    state: &Arc<Mutex<State>>,
    cache: &Arc<ActionCache>,
    registered: &mut Option<WorkerId>,
) {
    let mut state = state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    match message {
        Message::Hello { worker, capacity } => {
            info!(worker = %worker, capacity, "worker registered");
            *registered = Some(worker);
            state.workers.insert(
                worker,
                WorkerConn {
                    tx: tx.clone(),
                    capacity,
                    queue_depth: 0,
                    load: 0.0,
                    last_seen: Instant::now(),
                    outstanding: FxHashMap::default(),
                    breaker: CircuitBreaker::new(BreakerConfig::default()),
                    bucket: TokenBucket::new(f64::from(capacity.max(1)) * 4.0, 64.0),
                },
            );
            try_dispatch(&mut state);
        }
        Message::Heartbeat {
            worker,
            queue_depth,
            load,
        } => {
            if let Some(conn) = state.workers.get_mut(&worker) {
                conn.last_seen = Instant::now();
                conn.queue_depth = queue_depth;
                conn.load = load;
            }
        }
        Message::ActionResult {
            action,
            outputs,
            exit,
            stderr_digest,
            metrics,
        } => {
            if let Some(id) = *registered {
                if let Some(conn) = state.workers.get_mut(&id) {
                    conn.outstanding.remove(&action);
                    conn.last_seen = Instant::now();
                    conn.breaker.record_success();
                    conn.bucket.recover();
                }
            }
            if state.completed.contains_key(&action) {
                // Late duplicate after a re-enqueue; first commit won.
                debug!(action = %action, "duplicate completion deduped");
                return;
            }
            let outcome = RemoteOutcome {
                action,
                exit,
                outputs,
                stderr_digest,
                metrics,
            };
            state.completed.insert(action, outcome.clone());
            if let Some(waiters) = state.waiters.remove(&action) {
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
        }
        Message::FetchBlob { digest } => {
            drop(state);
            let reply = cache.blob_get(&digest).map_or_else(
                || Message::Error {
                    code: 404,
                    message: format!("blob {digest} not present"),
                },
                |bytes| Message::PutBlob {
                    digest,
                    bytes: bytes.to_vec(),
                },
            );
            let _ = tx.send(encode_message(&reply, correlation));
        }
        Message::PutBlob { digest, bytes } => {
            drop(state);
            let reply = match cache.blob_put_verified(digest, &bytes) {
                Ok(()) => Message::Ack,
                Err(err) => Message::Error {
                    code: 400,
                    message: err.to_string(),
                },
            };
            let _ = tx.send(encode_message(&reply, correlation));
        }
        Message::Steal { from_worker, max } => {
            // An idle worker pulls queued (undispatched) actions toward
            // itself, bypassing least-loaded selection.
            let mut handed = 0u32;
            while handed < max {
                let correlation = state.next_correlation;
                let Some(request) = state.queue.pop_front() else {
                    break;
                };
                state.next_correlation += 1;
                let frame = encode_message(
                    &Message::Enqueue {
                        action: request.action,
                        command: request.command.clone(),
                        spec: request.spec.clone(),
                        input_digests: request.input_digests.clone(),
                    },
                    correlation,
                );
                if let Some(conn) = state.workers.get_mut(&from_worker) {
                    if conn.tx.send(frame).is_ok() {
                        conn.outstanding.insert(request.action, request);
                        handed += 1;
                        continue;
                    }
                }
                state.queue.push_front(request);
                break;
            }
            if handed > 0 {
                debug!(worker = %from_worker, handed, "steal request served");
            }
        }
        Message::Ack | Message::Error { .. } => {
            // Correlated replies to frames we sent; nothing coordinator-side
            // awaits them today beyond logging.
            debug!(correlation, "reply frame received");
        }
        Message::Enqueue { .. } | Message::AbortAction { .. } => {
            warn!("worker sent a coordinator-only opcode, ignoring");
        }
    }
}
