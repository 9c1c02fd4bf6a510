// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Headless build worker daemon.
//!
//! Connects to a coordinator and serves actions until killed:
//!
//! ```sh
//! builder-workerd <coordinator-addr> [capacity]
//! ```
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![allow(clippy::print_stderr)]

use anyhow::{Context, Result};
use builder_remote::{run_worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args
        .next()
        .context("usage: builder-workerd <coordinator-addr> [capacity]")?;
    let capacity = match args.next() {
        Some(raw) => raw
            .parse::<u32>()
            .with_context(|| format!("capacity must be a number, got {raw:?}"))?,
        None => u32::try_from(
            std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get),
        )
        .unwrap_or(2),
    };

    let config = WorkerConfig {
        capacity,
        ..WorkerConfig::default()
    };
    let handle = run_worker(&addr, config)
        .await
        .with_context(|| format!("connecting to coordinator at {addr}"))?;
    tracing::info!(worker = %handle.id(), %addr, capacity, "worker serving");

    // Serve until the process is killed; the coordinator notices the dropped
    // connection and requeues anything outstanding.
    std::future::pending::<()>().await;
    Ok(())
}
