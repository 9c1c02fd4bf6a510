// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The build driver: a work-stealing pool walking the dependency graph
//! leaves-first, consulting the action cache before every execution.
//!
//! Each worker owns a LIFO deque. Completions push newly ready dependents
//! onto the *completing* worker's own queue (locality: the dependent's
//! inputs are warm in that worker's cache); idle workers steal FIFO from
//! random victims and park on a shared [`Parker`] after a round of failed
//! steals. A bounded semaphore caps in-flight actions regardless of worker
//! count.
//!
//! Per node the pipeline is: plan (via the language handler) → probe input
//! digests → derive the action key → single-flight → cache lookup →
//! hermetic execution on miss → CAS insert → completion bookkeeping.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use builder_cache::{derive_action_id, ActionCache, ActionKeyInputs, ActionRecord, Flight};
use builder_cas::{digest_of, Digest};
use builder_graph::{DepGraph, NodeRef, NodeStatus};
use builder_model::{BuildConfig, LanguageHandler, Workspace};
use builder_sandbox::{
    CancellationToken, HermeticExecutor, NetworkPolicy, SandboxSpec,
};
use crossbeam_deque::{Steal, Stealer, Worker};
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::{BuildError, NodeFailure};
use crate::pool::{Parker, Semaphore};

/// Failed-steal rounds before a worker parks.
const STEAL_ROUNDS: usize = 4;
/// Park timeout; a fallback wake in case every explicit wake was consumed.
const PARK_TIMEOUT: Duration = Duration::from_millis(20);
/// Base backoff for retryable infrastructure failures.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Counters for one build invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildMetrics {
    /// Actions actually executed.
    pub executed: usize,
    /// Nodes satisfied from the action cache.
    pub cache_hits: usize,
    /// Wall time of the whole invocation in milliseconds.
    pub wall_ms: u64,
}

/// Outcome of one build invocation.
#[derive(Debug)]
pub struct BuildReport {
    /// Execution counters.
    pub metrics: BuildMetrics,
    /// Every failed or skipped node, in discovery order.
    pub failures: Vec<NodeFailure>,
}

impl BuildReport {
    /// Did every requested node succeed?
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One build invocation over a resolved graph.
pub struct BuildSession<'a> {
    graph: &'a DepGraph,
    workspace: &'a Workspace,
    cache: &'a ActionCache,
    executor: &'a HermeticExecutor,
    handler: &'a dyn LanguageHandler,
    config: &'a BuildConfig,
    token: CancellationToken,
}

/// State shared by all workers of a session.
struct Shared {
    stealers: Vec<Stealer<NodeRef>>,
    parker: Parker,
    inflight: Semaphore,
    terminal: AtomicUsize,
    total: usize,
    done: AtomicBool,
    failures: Mutex<Vec<NodeFailure>>,
    executed: AtomicUsize,
    cache_hits: AtomicUsize,
    pinned: Mutex<Vec<ActionRecord>>,
    /// Declared output path → producing node, for dynamic-dep mapping.
    producers: FxHashMap<PathBuf, NodeRef>,
    /// Session-scoped memo of tool digests.
    tool_digests: Mutex<FxHashMap<PathBuf, Digest>>,
}

impl Shared {
    /// Count nodes that reached a terminal state; flip `done` at the end.
    fn mark_terminal(&self, count: usize) {
        if count == 0 {
            return;
        }
        let reached = self.terminal.fetch_add(count, Ordering::AcqRel) + count;
        if reached >= self.total {
            self.done.store(true, Ordering::Release);
            self.parker.wake_all();
        }
    }

    fn record_failure(&self, failure: NodeFailure) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(failure);
    }
}

impl<'a> BuildSession<'a> {
    /// Assemble a session over an already-resolved graph.
    pub fn new(
        graph: &'a DepGraph,
        workspace: &'a Workspace,
        cache: &'a ActionCache,
        executor: &'a HermeticExecutor,
        handler: &'a dyn LanguageHandler,
        config: &'a BuildConfig,
    ) -> Self {
        Self {
            graph,
            workspace,
            cache,
            executor,
            handler,
            config,
            token: CancellationToken::new(),
        }
    }

    /// The session's cancellation token (clone it into signal handlers).
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run the build to completion (or cancellation) and report.
    pub fn run(&self) -> BuildReport {
        let started = Instant::now();
        let total = self.graph.len();
        if total == 0 {
            // An empty graph builds successfully with zero actions.
            return BuildReport {
                metrics: BuildMetrics {
                    wall_ms: elapsed_ms(started),
                    ..BuildMetrics::default()
                },
                failures: Vec::new(),
            };
        }

        let worker_count = self.config.jobs.clamp(1, total.max(1));
        let queues: Vec<Worker<NodeRef>> =
            (0..worker_count).map(|_| Worker::new_lifo()).collect();

        // Seed the initial frontier round-robin across workers.
        for (i, node) in self.graph.ready_frontier().into_iter().enumerate() {
            queues[i % worker_count].push(node);
        }

        let mut producers = FxHashMap::default();
        for node in self.graph.nodes() {
            if let Some(target) = self.workspace.target(self.graph.node_id(node)) {
                for out in &target.outs {
                    producers.insert(out.clone(), node);
                }
            }
        }

        let shared = Shared {
            stealers: queues.iter().map(Worker::stealer).collect(),
            parker: Parker::new(),
            inflight: Semaphore::new(worker_count),
            terminal: AtomicUsize::new(0),
            total,
            done: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            pinned: Mutex::new(Vec::new()),
            producers,
            tool_digests: Mutex::new(FxHashMap::default()),
        };

        std::thread::scope(|s| {
            for (index, local) in queues.into_iter().enumerate() {
                let shared = &shared;
                s.spawn(move || self.worker_loop(index, &local, shared));
            }
        });

        // Sweep: anything not terminal after the pool exits was cancelled.
        let mut failures = std::mem::take(
            &mut *shared
                .failures
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for node in self.graph.nodes() {
            if !self.graph.status(node).is_terminal() {
                failures.push(NodeFailure {
                    target: self.graph.node_id(node).clone(),
                    error: BuildError::Cancelled,
                    stderr: Vec::new(),
                });
            }
        }

        // Session pins are released; the file-state journal is best-effort.
        for record in shared
            .pinned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
        {
            self.cache.unpin_record(record);
        }
        if let Err(err) = self.cache.persist_file_state() {
            warn!(error = %err, "file-state journal not persisted");
        }

        let metrics = BuildMetrics {
            executed: shared.executed.load(Ordering::Acquire),
            cache_hits: shared.cache_hits.load(Ordering::Acquire),
            wall_ms: elapsed_ms(started),
        };
        info!(
            executed = metrics.executed,
            cache_hits = metrics.cache_hits,
            wall_ms = metrics.wall_ms,
            failures = failures.len(),
            "build finished"
        );
        BuildReport { metrics, failures }
    }

    fn worker_loop(&self, index: usize, local: &Worker<NodeRef>, shared: &Shared) {
        let mut rng = rand::thread_rng();
        loop {
            if shared.done.load(Ordering::Acquire) || self.token.is_cancelled() {
                return;
            }
            if let Some(node) = local.pop().or_else(|| self.steal(index, shared, &mut rng)) {
                self.process(node, local, shared);
            } else {
                let seen = shared.parker.generation();
                // Last look before parking; a push may have raced us.
                if let Some(node) = local.pop().or_else(|| self.steal(index, shared, &mut rng)) {
                    self.process(node, local, shared);
                    continue;
                }
                shared.parker.park(seen, PARK_TIMEOUT);
            }
        }
    }

    /// FIFO-steal from random victims, a few rounds.
    fn steal(
        &self,
        me: usize,
        shared: &Shared,
        rng: &mut impl Rng,
    ) -> Option<NodeRef> {
        let n = shared.stealers.len();
        if n <= 1 {
            return None;
        }
        for _ in 0..STEAL_ROUNDS * n {
            let victim = rng.gen_range(0..n);
            if victim == me {
                continue;
            }
            loop {
                match shared.stealers[victim].steal() {
                    Steal::Success(node) => return Some(node),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }

    fn process(&self, node: NodeRef, local: &Worker<NodeRef>, shared: &Shared) {
        if !self.graph.claim_running(node) {
            return; // skipped or claimed elsewhere in the meantime
        }
        let result = self.build_node(node, shared);
        match result {
            Ok(cache_hit) => {
                if cache_hit {
                    shared.cache_hits.fetch_add(1, Ordering::AcqRel);
                } else {
                    shared.executed.fetch_add(1, Ordering::AcqRel);
                }
                let newly_ready = self.graph.complete_success(node);
                shared.mark_terminal(1);
                // Locality: dependents land on the completing worker's queue.
                for next in newly_ready {
                    local.push(next);
                }
                shared.parker.wake_all();
            }
            Err((error, stderr)) => self.fail_node(node, error, stderr, local, shared),
        }
    }

    fn fail_node(
        &self,
        node: NodeRef,
        error: BuildError,
        stderr: Vec<u8>,
        local: &Worker<NodeRef>,
        shared: &Shared,
    ) {
        let attempts = self.graph.attempts(node);
        self.graph.complete_failure(node);

        if error.is_retryable() && attempts < self.config.retry_limit && !self.token.is_cancelled()
        {
            if let Some(attempt) = self.graph.retry(node) {
                let backoff = RETRY_BACKOFF * 2u32.saturating_pow(attempt - 1);
                debug!(target = %self.graph.node_id(node), attempt, ?backoff, "retrying after infrastructure failure");
                std::thread::sleep(backoff);
                local.push(node);
                shared.parker.wake_all();
                return;
            }
        }

        let cause = self.graph.node_id(node).clone();
        warn!(target = %cause, error = %error, "node failed");
        shared.record_failure(NodeFailure {
            target: cause.clone(),
            error,
            stderr,
        });
        shared.mark_terminal(1);

        let skipped = self.graph.skip_cone(node);
        for s in &skipped {
            shared.record_failure(NodeFailure {
                target: self.graph.node_id(*s).clone(),
                error: BuildError::Skipped {
                    cause: cause.clone(),
                },
                stderr: Vec::new(),
            });
        }
        shared.mark_terminal(skipped.len());

        if !self.config.keep_going {
            self.token.cancel();
        }
        shared.parker.wake_all();
    }

    /// Plan, hash, consult the cache, and execute if needed. `Ok(true)` is a
    /// cache hit, `Ok(false)` an execution.
    fn build_node(
        &self,
        node: NodeRef,
        shared: &Shared,
    ) -> Result<bool, (BuildError, Vec<u8>)> {
        let target = self
            .workspace
            .target(self.graph.node_id(node))
            .ok_or_else(|| {
                (
                    BuildError::Handler(builder_model::HandlerError::UnknownDependency {
                        target: self.graph.node_id(node).clone(),
                        dep: self.graph.node_id(node).clone(),
                    }),
                    Vec::new(),
                )
            })?;

        let plan = self
            .handler
            .build(target, self.workspace)
            .map_err(|err| (BuildError::Handler(err), Vec::new()))?;

        // Dynamic discovery: imports either join the input set (plain files,
        // or outputs of already-built nodes) or become graph edges for nodes
        // still in flight.
        let mut inputs = plan.inputs.clone();
        for import in self.handler.analyze_imports(&target.srcs) {
            match shared.producers.get(&import.path) {
                Some(&producer) if self.graph.status(producer) != NodeStatus::Success => {
                    if let Err(err) = self.graph.attach_dynamic_deps(node, &[producer]) {
                        warn!(target = %target.id, error = %err, "dynamic dep rejected");
                    }
                }
                _ => inputs.push(import.path),
            }
        }
        inputs.sort();
        inputs.dedup();

        let mut input_digests = Vec::with_capacity(inputs.len());
        for rel in &inputs {
            match self.cache.files().probe(self.workspace.root(), rel) {
                Ok((digest, _)) => input_digests.push((rel.clone(), digest)),
                Err(err) => {
                    debug!(input = %rel.display(), error = %err, "input probe failed");
                    return Err((
                        BuildError::MissingInput { path: rel.clone() },
                        Vec::new(),
                    ));
                }
            }
        }

        let tool_digest = self.tool_digest(&plan.tool, shared);
        let id = derive_action_id(&ActionKeyInputs {
            tool_digest,
            argv: &plan.argv,
            env: &plan.env,
            inputs: &input_digests,
            outputs: &plan.outputs,
        });

        match self.cache.flights().join(id) {
            Flight::Follower(Some(record)) if record.success => {
                // Someone else just built this exact action.
                match self.cache.materialize(&record, self.workspace.root()) {
                    Ok(true) => {
                        self.pin(record, shared);
                        Ok(true)
                    }
                    _ => self.execute_leaderless(&plan, &inputs, id, shared),
                }
            }
            Flight::Follower(_) => self.execute_leaderless(&plan, &inputs, id, shared),
            Flight::Leader(guard) => {
                if let Some(record) = self.cache.lookup(&id) {
                    if record.success
                        && matches!(
                            self.cache.materialize(&record, self.workspace.root()),
                            Ok(true)
                        )
                    {
                        debug!(target = %target.id, action = %id, "cache hit");
                        self.pin(record.clone(), shared);
                        guard.publish(record);
                        return Ok(true);
                    }
                }
                let record = self.execute(&plan, &inputs, id, shared)?;
                guard.publish(record);
                Ok(false)
            }
        }
    }

    /// Execution path for followers whose leader abandoned: run without
    /// publishing (the cache still dedupes by record).
    fn execute_leaderless(
        &self,
        plan: &builder_model::ActionPlan,
        inputs: &[PathBuf],
        id: builder_cache::ActionId,
        shared: &Shared,
    ) -> Result<bool, (BuildError, Vec<u8>)> {
        if let Some(record) = self.cache.lookup(&id) {
            if record.success
                && matches!(
                    self.cache.materialize(&record, self.workspace.root()),
                    Ok(true)
                )
            {
                self.pin(record, shared);
                return Ok(true);
            }
        }
        self.execute(plan, inputs, id, shared)?;
        Ok(false)
    }

    /// Actually run the action hermetically and commit its results.
    fn execute(
        &self,
        plan: &builder_model::ActionPlan,
        inputs: &[PathBuf],
        id: builder_cache::ActionId,
        shared: &Shared,
    ) -> Result<ActionRecord, (BuildError, Vec<u8>)> {
        let spec = self
            .sandbox_spec(plan, inputs)
            .map_err(|err| (BuildError::InvalidSpec(err), Vec::new()))?;

        let _permit = shared.inflight.acquire();
        let started = Instant::now();
        let outcome = if self.config.strict_determinism {
            self.executor
                .run_strict(&plan.tool, &plan.argv, &spec, &self.token, 2)
        } else {
            self.executor.run(&plan.tool, &plan.argv, &spec, &self.token)
        }
        .map_err(|err| (BuildError::Exec(err), Vec::new()))?;

        if !outcome.success() {
            let stderr_digest = digest_of(&outcome.stderr);
            return Err((
                BuildError::Exec(builder_sandbox::ExecError::NonZeroExit {
                    code: outcome.exit_code,
                    stderr_digest,
                }),
                outcome.stderr,
            ));
        }

        for declared in &plan.outputs {
            if !outcome.output_digests.iter().any(|(p, _)| p == declared) {
                return Err((
                    BuildError::OutputMissing {
                        path: declared.clone(),
                    },
                    outcome.stderr,
                ));
            }
        }

        match self.cache.insert(
            id,
            self.workspace.root(),
            &plan.outputs,
            true,
            Some(outcome.exit_code),
            &outcome.stderr,
            elapsed_ms(started),
        ) {
            Ok(record) => {
                self.pin(record.clone(), shared);
                Ok(record)
            }
            Err(err) => {
                // Cache trouble never fails a build: synthesize an in-memory
                // record so the flight can still publish.
                warn!(action = %id, error = %err, "cache insert failed; continuing uncached");
                Ok(ActionRecord {
                    action: id,
                    outputs: outcome.output_digests.clone(),
                    success: true,
                    stderr: digest_of(&outcome.stderr),
                    exit_code: Some(outcome.exit_code),
                    wall_ms: elapsed_ms(started),
                })
            }
        }
    }

    fn sandbox_spec(
        &self,
        plan: &builder_model::ActionPlan,
        inputs: &[PathBuf],
    ) -> Result<SandboxSpec, builder_sandbox::InvalidSpec> {
        let mut builder = SandboxSpec::builder()
            .inputs(inputs.iter().cloned())
            .outputs(plan.outputs.iter().cloned())
            .network(NetworkPolicy::Denied);
        for (key, value) in &plan.env {
            builder = builder.env(key, value);
        }
        if self.config.strict_determinism {
            if let Some(epoch) = &self.config.source_date_epoch {
                builder = builder
                    .env("SOURCE_DATE_EPOCH", epoch)
                    .permit_env("SOURCE_DATE_EPOCH");
            }
        }
        builder.build()
    }

    fn pin(&self, record: ActionRecord, shared: &Shared) {
        self.cache.pin_record(&record);
        shared
            .pinned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record);
    }

    /// Digest of the tool binary, memoized per session. Unreadable tools
    /// (PATH-resolved names) hash as their identity string.
    fn tool_digest(&self, tool: &Path, shared: &Shared) -> Digest {
        let mut memo = shared
            .tool_digests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(digest) = memo.get(tool) {
            return *digest;
        }
        let resolved = if tool.is_absolute() {
            tool.to_path_buf()
        } else {
            self.workspace.root().join(tool)
        };
        let digest = std::fs::read(&resolved)
            .map(|bytes| digest_of(&bytes))
            .unwrap_or_else(|_| digest_of(tool.to_string_lossy().as_bytes()));
        memo.insert(tool.to_path_buf(), digest);
        digest
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
