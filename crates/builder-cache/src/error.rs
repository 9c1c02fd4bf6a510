// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cache error taxonomy.
//!
//! Every variant here is recoverable by policy: the scheduler treats cache
//! failures as misses and recomputes. Nothing in this enum may fail a build.

use builder_cas::CasError;

/// Errors from the action cache and its persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Filesystem failure reading or writing cache state.
    #[error("[CACHE_IO] {0}")]
    Io(#[from] std::io::Error),

    /// Underlying blob store failure.
    #[error("[CACHE_CAS] {0}")]
    Cas(#[from] CasError),

    /// A persisted record or journal entry failed to decode.
    #[error("[CACHE_CORRUPTED] {detail}")]
    Corrupted {
        /// What failed to decode, for the `builder clean --cache` hint.
        detail: String,
    },

    /// An input file referenced by an action does not exist.
    ///
    /// This one is surfaced to the user (missing inputs are a target
    /// configuration problem, not cache damage), but it still never forces a
    /// rebuild loop: the action simply fails.
    #[error("[CACHE_MISSING_INPUT] {path}")]
    MissingInput {
        /// Workspace-relative path of the missing input.
        path: std::path::PathBuf,
    },

    /// A declared output was absent after the action reported success.
    #[error("[CACHE_MISSING_OUTPUT] {path}")]
    MissingOutput {
        /// Workspace-relative path of the undeclared-but-promised output.
        path: std::path::PathBuf,
    },
}
