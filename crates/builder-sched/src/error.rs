// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-node build failures as values.
//!
//! Errors flow through the scheduler as data attached to nodes, never as
//! panics or early returns: a failed node is a node in the `Failed` state
//! plus one of these values in the build report.

use builder_model::{HandlerError, TargetId};
use builder_sandbox::{ExecError, InvalidSpec};
use std::path::PathBuf;

/// Why a node failed (or was skipped).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The language handler could not plan the action.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The sandbox spec derived from the target is invalid.
    #[error(transparent)]
    InvalidSpec(#[from] InvalidSpec),

    /// The hermetic executor failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// An input file is missing or unreadable.
    #[error("input {path} is missing")]
    MissingInput {
        /// Workspace-relative path.
        path: PathBuf,
    },

    /// The action exited zero but a declared output was not produced.
    #[error("declared output {path} was not produced")]
    OutputMissing {
        /// Workspace-relative path.
        path: PathBuf,
    },

    /// An upstream dependency failed; this node never ran.
    #[error("skipped: upstream {cause} failed")]
    Skipped {
        /// The failed upstream target.
        cause: TargetId,
    },

    /// The build was cancelled before this node could run.
    #[error("cancelled")]
    Cancelled,
}

impl BuildError {
    /// Infrastructure failures are worth retrying; real build failures are
    /// not — a compiler error does not get better the second time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Exec(ExecError::Spawn { .. } | ExecError::SandboxFailed { .. })
        )
    }
}

/// One failed node in the report.
#[derive(Debug)]
pub struct NodeFailure {
    /// The failed target.
    pub target: TargetId,
    /// Why it failed.
    pub error: BuildError,
    /// Captured stderr, when the action ran at all.
    pub stderr: Vec<u8>,
}
