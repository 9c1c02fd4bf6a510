// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Distributed-layer errors.

use builder_cas::Digest;
use builder_proto::{WireError, WorkerId};

/// Errors from the coordinator/worker layer.
///
/// Network trouble is recovered transparently up to the retry budget before
/// any of these reach a caller; what does reach the caller is terminal for
/// that dispatch (the local executor remains as a fallback).
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// A specific worker stopped answering.
    #[error("worker {0} unreachable")]
    WorkerUnreachable(WorkerId),

    /// No registered worker can accept work right now.
    #[error("no workers available")]
    NoWorkers,

    /// A request exceeded its per-class deadline.
    #[error("{class} timed out after {ms} ms")]
    Timeout {
        /// Message class that timed out (e.g. "action", "blob-fetch").
        class: &'static str,
        /// The deadline in milliseconds.
        ms: u64,
    },

    /// Protocol decode or version failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An input blob could not be fetched from any source.
    #[error("blob {0} unavailable")]
    BlobMissing(Digest),

    /// The action was aborted by the coordinator.
    #[error("action aborted")]
    Aborted,
}
