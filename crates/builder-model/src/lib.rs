// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Target model, workspace, and configuration for builder.
//!
//! This crate is the vocabulary shared by every other builder crate: validated
//! target labels, the immutable [`Target`] description, the [`Workspace`] that
//! owns targets for one build invocation, [`BuildConfig`] read from the
//! environment, and the [`LanguageHandler`] seam through which per-language
//! command construction is plugged in. The execution core never constructs a
//! compiler command line itself — it asks the handler for a fully specified
//! [`ActionPlan`] and runs it hermetically.
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

mod config;
mod handler;
mod label;
mod suggest;
mod target;
mod workspace;

pub use config::{BuildConfig, ConfigError};
pub use handler::{ActionPlan, CommandHandler, HandlerError, Import, LanguageHandler};
pub use label::{LabelError, TargetId};
pub use suggest::did_you_mean;
pub use target::{Target, TargetKind};
pub use workspace::Workspace;
