// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Work-stealing build scheduler for builder.
//!
//! [`BuildSession`] drives one build invocation: a fixed pool of OS threads
//! (P = `BuildConfig::jobs`), per-worker LIFO deques with FIFO stealing,
//! DAG-constrained dispatch with cache consultation before every execution,
//! bounded in-flight backpressure, cooperative cancellation, and configurable
//! failure policy (fail-fast or keep-going). The only inter-action ordering
//! enforced anywhere is the dependency graph.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod driver;
mod error;
mod pool;

pub use driver::{BuildMetrics, BuildReport, BuildSession};
pub use error::{BuildError, NodeFailure};
pub use pool::{Parker, Semaphore, SemaphoreGuard};
