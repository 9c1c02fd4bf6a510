// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Execution error surface.

use builder_cas::Digest;
use std::path::PathBuf;

use crate::monitor::Violation;

/// Errors from hermetic action execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The child process could not be started.
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        /// Tool that failed to launch.
        tool: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Wall-clock ceiling exceeded; the child was killed.
    #[error("action exceeded wall limit of {limit_ms} ms")]
    Timeout {
        /// The configured ceiling in milliseconds.
        limit_ms: u64,
    },

    /// A hard resource limit was exceeded; the child was terminated.
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(Violation),

    /// The sandbox itself could not be constructed or torn down.
    #[error("sandbox failure: {detail}")]
    SandboxFailed {
        /// What went wrong (strategy, path, OS error).
        detail: String,
    },

    /// The command ran and exited non-zero.
    #[error("command exited with code {code}")]
    NonZeroExit {
        /// Exit code reported by the OS.
        code: i32,
        /// Digest of captured stderr (the bytes live in the CAS).
        stderr_digest: Digest,
    },

    /// Strict determinism verification found diverging outputs.
    #[error("non-deterministic output: {} path(s) diverged across runs", digests.len())]
    NonDeterministicOutput {
        /// Output path with the digest from each verification run.
        digests: Vec<(PathBuf, Digest, Digest)>,
    },

    /// Cancellation was observed; the child received SIGTERM then SIGKILL.
    #[error("action cancelled")]
    Cancelled,
}
