// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Build configuration from explicit options and `BUILDER_*` environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration errors. These map to exit code 2 at the CLI surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `BUILDER_JOBS` was present but not a positive integer.
    #[error("BUILDER_JOBS must be a positive integer, got {0:?}")]
    InvalidJobs(String),

    /// A boolean env var held something other than 0/1/true/false.
    #[error("{var} must be a boolean (0/1/true/false), got {value:?}")]
    InvalidBool {
        /// The offending variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Enumerated build options. No duck-typed maps: every knob is a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Worker thread count P. Defaults to hardware parallelism.
    pub jobs: usize,
    /// Continue independent subgraphs after a failure.
    pub keep_going: bool,
    /// Root of the persistent cache (`cas/`, `actions/`, `state/`).
    pub cache_dir: PathBuf,
    /// Run every action twice and require identical output digests.
    pub strict_determinism: bool,
    /// Retry budget per node for infrastructure failures.
    pub retry_limit: u32,
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    pub grace: Duration,
    /// Verbose logging requested.
    pub verbose: bool,
    /// `SOURCE_DATE_EPOCH` passthrough for strict-determinism envs.
    pub source_date_epoch: Option<String>,
}

impl BuildConfig {
    /// Defaults for a workspace rooted at `workspace_root`.
    pub fn new(workspace_root: &std::path::Path) -> Self {
        Self {
            jobs: default_jobs(),
            keep_going: false,
            cache_dir: workspace_root.join(".cache"),
            strict_determinism: false,
            retry_limit: 3,
            grace: Duration::from_secs(5),
            verbose: false,
            source_date_epoch: None,
        }
    }

    /// Defaults overridden by the `BUILDER_*` environment.
    ///
    /// Consulted variables: `BUILDER_CACHE_DIR`, `BUILDER_JOBS`,
    /// `BUILDER_KEEP_GOING`, `BUILDER_VERBOSE`, `SOURCE_DATE_EPOCH`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a variable is present but malformed.
    pub fn from_env(workspace_root: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = Self::new(workspace_root);
        if let Ok(dir) = std::env::var("BUILDER_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Ok(jobs) = std::env::var("BUILDER_JOBS") {
            config.jobs = match jobs.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidJobs(jobs)),
            };
        }
        if let Ok(value) = std::env::var("BUILDER_KEEP_GOING") {
            config.keep_going = parse_bool("BUILDER_KEEP_GOING", &value)?;
        }
        if let Ok(value) = std::env::var("BUILDER_VERBOSE") {
            config.verbose = parse_bool("BUILDER_VERBOSE", &value)?;
        }
        if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
            config.source_date_epoch = Some(epoch);
        }
        Ok(config)
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(ConfigError::InvalidBool {
            var,
            value: other.to_owned(),
        }),
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
