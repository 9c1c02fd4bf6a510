// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The hermetic executor: stage, run, monitor, harvest.
//!
//! Every action runs in a freshly staged sandbox root: declared inputs are
//! copied in (read-only), declared temp dirs are created, the command runs
//! with a scrubbed environment and the strategy's isolation, and declared
//! outputs are harvested back into the workspace with their digests. The
//! scratch root is a `TempDir` and evaporates on drop, success or not.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::Duration;

use builder_cas::{digest_of, Digest};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::monitor::{LimitKind, ResourceMonitor, ResourceUsage};
use crate::spec::SandboxSpec;
use crate::{CancellationToken, ExecError, Strategy};

/// Poll interval for the wait loop.
const WAIT_TICK: Duration = Duration::from_millis(10);

/// What one completed execution produced.
///
/// "Completed" means the child ran to an exit status — a non-zero exit is an
/// outcome here and becomes [`ExecError::NonZeroExit`] only through
/// [`ExecOutcome::into_result`], so callers that want stderr for reporting
/// can take it first.
#[derive(Debug)]
pub struct ExecOutcome {
    /// Exit code (`-1` when the child died to a signal).
    pub exit_code: i32,
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Monitored resource usage.
    pub usage: ResourceUsage,
    /// Digest per declared output that was actually produced, sorted by
    /// path. Missing outputs are simply absent — the caller decides whether
    /// that is an error.
    pub output_digests: Vec<(PathBuf, Digest)>,
}

impl ExecOutcome {
    /// Whether the child exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into [`ExecError::NonZeroExit`].
    ///
    /// # Errors
    ///
    /// [`ExecError::NonZeroExit`] carrying the exit code and stderr digest.
    pub fn into_result(self) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::NonZeroExit {
                code: self.exit_code,
                stderr_digest: digest_of(&self.stderr),
            })
        }
    }
}

/// Hermetic action executor bound to one workspace.
#[derive(Debug)]
pub struct HermeticExecutor {
    strategy: Strategy,
    workspace_root: PathBuf,
    grace: Duration,
}

impl HermeticExecutor {
    /// Executor with the strongest detected strategy.
    pub fn new(workspace_root: impl Into<PathBuf>, grace: Duration) -> Self {
        Self {
            strategy: Strategy::detect(),
            workspace_root: workspace_root.into(),
            grace,
        }
    }

    /// Executor with a forced strategy (tests use [`Strategy::Fallback`]).
    pub fn with_strategy(
        workspace_root: impl Into<PathBuf>,
        grace: Duration,
        strategy: Strategy,
    ) -> Self {
        Self {
            strategy,
            workspace_root: workspace_root.into(),
            grace,
        }
    }

    /// The strategy in use.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Run `tool argv…` under `spec`, harvesting declared outputs back into
    /// the workspace.
    ///
    /// # Errors
    ///
    /// Any [`ExecError`] except `NonZeroExit` — a non-zero exit is returned
    /// as an outcome (see [`ExecOutcome::into_result`]).
    pub fn run(
        &self,
        tool: &Path,
        argv: &[String],
        spec: &SandboxSpec,
        token: &CancellationToken,
    ) -> Result<ExecOutcome, ExecError> {
        if token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let scratch = self.stage(spec)?;
        let outcome = self.run_staged(scratch.path(), tool, argv, spec, token)?;
        self.harvest(scratch.path(), spec, outcome)
    }

    /// Strict determinism mode: run `runs` times in fresh sandboxes and
    /// require byte-identical outputs.
    ///
    /// # Errors
    ///
    /// [`ExecError::NonDeterministicOutput`] when any output digest diverges
    /// between runs; otherwise as [`run`](Self::run).
    pub fn run_strict(
        &self,
        tool: &Path,
        argv: &[String],
        spec: &SandboxSpec,
        token: &CancellationToken,
        runs: u32,
    ) -> Result<ExecOutcome, ExecError> {
        let runs = runs.max(2);
        let first = self.run(tool, argv, spec, token)?;
        if !first.success() {
            // No point verifying a failing action.
            return Ok(first);
        }
        let reference: BTreeMap<PathBuf, Digest> = first.output_digests.iter().cloned().collect();
        let mut last = first;
        for attempt in 1..runs {
            let next = self.run(tool, argv, spec, token)?;
            let mut diverged = Vec::new();
            for (path, digest) in &next.output_digests {
                match reference.get(path) {
                    Some(expected) if expected != digest => {
                        diverged.push((path.clone(), *expected, *digest));
                    }
                    _ => {}
                }
            }
            if !diverged.is_empty() {
                info!(
                    attempt,
                    "determinism check failed; consider SOURCE_DATE_EPOCH or stripping \
                     embedded timestamps from outputs"
                );
                return Err(ExecError::NonDeterministicOutput { digests: diverged });
            }
            last = next;
        }
        Ok(last)
    }

    /// Copy declared inputs into a fresh scratch root and prepare temp and
    /// output directories.
    fn stage(&self, spec: &SandboxSpec) -> Result<TempDir, ExecError> {
        let scratch = TempDir::new().map_err(|err| ExecError::SandboxFailed {
            detail: format!("creating sandbox root: {err}"),
        })?;
        let root = scratch.path();

        for rel in spec.inputs() {
            let src = self.workspace_root.join(rel);
            let dst = root.join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(stage_err(rel))?;
            }
            fs::copy(&src, &dst).map_err(stage_err(rel))?;
        }
        for rel in spec.temps() {
            fs::create_dir_all(root.join(rel)).map_err(stage_err(rel))?;
        }
        for rel in spec.outputs() {
            if let Some(parent) = rel.parent() {
                fs::create_dir_all(root.join(parent)).map_err(stage_err(rel))?;
            }
        }
        // A private TMPDIR regardless of declared temps.
        fs::create_dir_all(root.join(".tmp")).map_err(|err| ExecError::SandboxFailed {
            detail: format!("creating sandbox tmp: {err}"),
        })?;
        Ok(scratch)
    }

    fn run_staged(
        &self,
        root: &Path,
        tool: &Path,
        argv: &[String],
        spec: &SandboxSpec,
        token: &CancellationToken,
    ) -> Result<RawOutcome, ExecError> {
        let mut command = self.strategy.command(root, spec, tool, argv)?;
        command
            .current_dir(root)
            .env_clear()
            .envs(spec.env())
            .env("TMPDIR", root.join(".tmp"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            tool: tool.to_path_buf(),
            source,
        })?;

        // Drain pipes on their own threads; a full pipe would deadlock the
        // wait loop otherwise.
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let mut monitor = ResourceMonitor::start(child.id());
        let limits = spec.limits();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    return Err(ExecError::SandboxFailed {
                        detail: format!("waiting on child: {err}"),
                    })
                }
            }

            if token.is_cancelled() {
                self.terminate(&mut child);
                return Err(ExecError::Cancelled);
            }
            if let Some(wall) = limits.wall {
                if monitor.elapsed() > wall {
                    self.terminate(&mut child);
                    return Err(ExecError::Timeout {
                        limit_ms: u64::try_from(wall.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            monitor.sample();
            std::thread::sleep(WAIT_TICK);
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        let (usage, violations) = monitor.stop(&limits);
        if let Some(violation) = violations
            .into_iter()
            .find(|v| v.kind != LimitKind::Wall)
        {
            return Err(ExecError::ResourceExceeded(violation));
        }
        check_wall_violation(&usage, &limits)?;

        let exit_code = status.code().unwrap_or(-1);
        debug!(exit_code, wall = ?usage.wall, "action finished");
        Ok(RawOutcome {
            exit_code,
            stdout,
            stderr,
            usage,
        })
    }

    /// Copy produced outputs back into the workspace, digesting as we go.
    fn harvest(
        &self,
        root: &Path,
        spec: &SandboxSpec,
        raw: RawOutcome,
    ) -> Result<ExecOutcome, ExecError> {
        let mut output_digests = Vec::new();
        for rel in spec.outputs() {
            let produced = root.join(rel);
            let bytes = match fs::read(&produced) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(ExecError::SandboxFailed {
                        detail: format!("reading output {}: {err}", rel.display()),
                    })
                }
            };
            let dest = self.workspace_root.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(stage_err(rel))?;
            }
            fs::write(&dest, &bytes).map_err(stage_err(rel))?;
            // Keep the mode the action set (executables stay executable).
            if let Ok(meta) = fs::metadata(&produced) {
                let _ = fs::set_permissions(&dest, meta.permissions());
            }
            output_digests.push((rel.clone(), digest_of(&bytes)));
        }
        Ok(ExecOutcome {
            exit_code: raw.exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            usage: raw.usage,
            output_digests,
        })
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Ok(pid) = i32::try_from(child.id()) {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
            let deadline = std::time::Instant::now() + self.grace;
            while std::time::Instant::now() < deadline {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return;
                }
                std::thread::sleep(WAIT_TICK);
            }
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

#[derive(Debug)]
struct RawOutcome {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    usage: ResourceUsage,
}

fn stage_err(rel: &Path) -> impl FnOnce(std::io::Error) -> ExecError + '_ {
    move |err| ExecError::SandboxFailed {
        detail: format!("staging {}: {err}", rel.display()),
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn check_wall_violation(
    usage: &ResourceUsage,
    limits: &crate::spec::ResourceLimits,
) -> Result<(), ExecError> {
    if let Some(wall) = limits.wall {
        if usage.wall > wall {
            return Err(ExecError::Timeout {
                limit_ms: u64::try_from(wall.as_millis()).unwrap_or(u64::MAX),
            });
        }
    }
    Ok(())
}
