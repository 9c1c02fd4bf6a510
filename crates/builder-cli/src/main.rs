// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `builder` — polyglot build system CLI.
//!
//! Thin shell over the execution core: argument parsing, tracing setup, and
//! the exit-code contract live here; everything else is the core crates.
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
    clippy::dbg_macro
)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    // The CLI is the one place that talks to stdout/stderr directly.
    clippy::print_stdout,
    clippy::print_stderr
)]

mod commands;
mod manifest;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "builder", version, about = "Polyglot, cache-first build system")]
struct Cli {
    /// Verbose logging (also: BUILDER_VERBOSE=1).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the named targets (all targets when none are given).
    Build {
        /// Target labels, e.g. `//src/core:lib`.
        targets: Vec<String>,
        /// Worker thread count (also: BUILDER_JOBS).
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Continue independent subgraphs after a failure.
        #[arg(long)]
        keep_going: bool,
        /// Run every action twice and require identical outputs.
        #[arg(long)]
        strict_determinism: bool,
    },
    /// Build, then run test targets. Exit 3 on test failure.
    Test {
        /// Target labels.
        targets: Vec<String>,
        /// Worker thread count.
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Continue independent subgraphs after a failure.
        #[arg(long)]
        keep_going: bool,
    },
    /// Graph queries: `order`, `deps <label>`, `rdeps <label>`.
    Query {
        /// Query expression.
        expr: Vec<String>,
    },
    /// Remove declared outputs; `--cache` also drops records and CAS.
    Clean {
        /// Clear the action cache too (records first, then blobs).
        #[arg(long)]
        cache: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let verbose = cli.verbose || std::env::var("BUILDER_VERBOSE").is_ok_and(|v| v == "1");
    tracing_subscriber::fmt()
        .with_max_level(if verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_writer(std::io::stderr)
        .init();

    let root = match std::env::current_dir() {
        Ok(root) => root,
        Err(err) => {
            eprintln!("error: cannot determine working directory: {err}");
            std::process::exit(i32::from(commands::EXIT_CONFIG));
        }
    };

    let code = match cli.command {
        Command::Build {
            targets,
            jobs,
            keep_going,
            strict_determinism,
        } => commands::build(
            &root,
            &targets,
            commands::BuildOptions {
                jobs,
                keep_going,
                strict_determinism,
            },
        ),
        Command::Test {
            targets,
            jobs,
            keep_going,
        } => commands::test(
            &root,
            &targets,
            commands::BuildOptions {
                jobs,
                keep_going,
                strict_determinism: false,
            },
        ),
        Command::Query { expr } => commands::query(&root, &expr),
        Command::Clean { cache } => commands::clean(&root, cache),
    };
    std::process::exit(i32::from(code));
}
