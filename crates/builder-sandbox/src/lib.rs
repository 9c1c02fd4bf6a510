// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hermetic action execution for builder.
//!
//! An action's result must depend only on its declared inputs — that is what
//! makes the action cache sound. This crate enforces it in three layers:
//!
//! 1. [`SandboxSpec`] — a validated declaration of what the action may read,
//!    write, see in its environment, and consume in resources;
//! 2. [`Strategy`] — per-platform isolation (Linux namespaces, macOS
//!    Seatbelt, a best-effort Windows mode, and a portable fallback);
//! 3. [`HermeticExecutor`] — staging, monitored execution with cooperative
//!    cancellation (SIGTERM → grace → SIGKILL), output harvesting, and an
//!    optional strict mode that re-runs actions to verify determinism.
//!
//! The authoritative determinism check is equal-output verification: syscall
//! interception for time/randomness is platform-best-effort at most, but two
//! runs producing identical digests is proof enough for caching purposes.
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

mod cancel;
mod error;
mod exec;
mod monitor;
mod spec;
mod strategy;

pub use cancel::CancellationToken;
pub use error::ExecError;
pub use exec::{ExecOutcome, HermeticExecutor};
pub use monitor::{LimitKind, ResourceMonitor, ResourceUsage, Violation};
pub use spec::{
    InvalidSpec, NetworkPolicy, ResourceLimits, SandboxSpec, SandboxSpecBuilder, SpecViolation,
};
pub use strategy::Strategy;
