// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Distributed coordinator/worker layer for builder.
//!
//! Scales the build beyond one machine while preserving the local layer's
//! guarantees: single-flight per [`ActionId`](builder_cache::ActionId)
//! (late duplicates dedupe at the coordinator), CAS semantics (workers pull
//! inputs and push outputs by digest, any source is as good as any other),
//! and DAG-only ordering (the coordinator never reorders, it only places).
//!
//! Resilience is per-endpoint: a rolling-window [`CircuitBreaker`] gates
//! every dispatch, a [`TokenBucket`] shapes the rate and shrinks when the
//! breaker trips, and a heartbeat reaper re-enqueues actions stranded on
//! dead workers. The [`LoadPredictor`] folds fleet utilization into
//! scale-up/down recommendations; it performs no provisioning.
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

mod breaker;
mod conn;
mod coordinator;
mod error;
mod predictor;
mod ratelimit;
mod worker;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use coordinator::{Coordinator, DispatchRequest, RemoteConfig, RemoteOutcome};
pub use error::RemoteError;
pub use predictor::{LoadPredictor, PredictorConfig, ScaleDecision};
pub use ratelimit::TokenBucket;
pub use worker::{run_worker, WorkerConfig, WorkerHandle};
