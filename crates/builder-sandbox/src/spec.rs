// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sandbox specifications and their validating builder.
//!
//! A [`SandboxSpec`] declares everything an action may touch: readable input
//! paths, writable output paths, scratch temp dirs, the environment whitelist,
//! a network policy, and resource limits. `build()` validates the whole spec
//! and reports **all** violations at once — a spec with three problems fails
//! with three diagnostics, not one per attempt.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Env keys that leak host identity or time into actions. Whitelisting one of
/// these requires an explicit `permit_env` call.
const HERMETIC_DENY_KEYS: &[&str] = &["HOME", "USER", "LOGNAME", "TZ", "DATE", "EPOCHSECONDS"];

/// What the action may do with the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkPolicy {
    /// No network at all (hermetic default).
    #[default]
    Denied,
    /// Loopback only.
    Loopback,
    /// Unrestricted (explicitly opting out of hermeticity).
    Full,
}

/// Resource ceilings for one action. `None` is the documented `unlimited`
/// sentinel; a present limit must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    /// Peak resident memory in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU time in milliseconds.
    pub cpu_ms: Option<u64>,
    /// Wall-clock ceiling.
    pub wall: Option<Duration>,
}

/// A single validation failure. `build()` collects every one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecViolation {
    /// A path is declared as both input and output.
    #[error("path {0} is declared as both input and output")]
    OutputOverlapsInput(PathBuf),

    /// A path is declared as both temp and output.
    #[error("path {0} is declared as both temp and output")]
    OutputOverlapsTemp(PathBuf),

    /// A hermeticity-breaking env key without an explicit permit.
    #[error("env key {0} breaks hermeticity; call permit_env to allow it")]
    ForbiddenEnvKey(String),

    /// A limit of zero — use `None` for unlimited.
    #[error("{0} limit must be positive (omit for unlimited)")]
    NonPositiveLimit(&'static str),
}

/// Invalid spec error carrying every violation found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sandbox spec: {}", format_violations(violations))]
pub struct InvalidSpec {
    /// All violations, in declaration order.
    pub violations: Vec<SpecViolation>,
}

fn format_violations(violations: &[SpecViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A validated sandbox specification. Construct via [`SandboxSpec::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    inputs: BTreeSet<PathBuf>,
    outputs: BTreeSet<PathBuf>,
    temps: BTreeSet<PathBuf>,
    env: BTreeMap<String, String>,
    network: NetworkPolicy,
    limits: ResourceLimits,
}

impl SandboxSpec {
    /// Start building a spec.
    pub fn builder() -> SandboxSpecBuilder {
        SandboxSpecBuilder::default()
    }

    /// Readable input paths (workspace-relative, sorted).
    pub fn inputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.inputs.iter()
    }

    /// Writable output paths (workspace-relative, sorted).
    pub fn outputs(&self) -> impl Iterator<Item = &PathBuf> {
        self.outputs.iter()
    }

    /// Scratch directories created inside the sandbox root.
    pub fn temps(&self) -> impl Iterator<Item = &PathBuf> {
        self.temps.iter()
    }

    /// The whitelisted environment.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Network policy.
    pub fn network(&self) -> NetworkPolicy {
        self.network
    }

    /// Resource limits.
    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }
}

/// Fluent, validating builder for [`SandboxSpec`].
#[derive(Debug, Default, Clone)]
pub struct SandboxSpecBuilder {
    inputs: BTreeSet<PathBuf>,
    outputs: BTreeSet<PathBuf>,
    temps: BTreeSet<PathBuf>,
    env: BTreeMap<String, String>,
    permitted_env: BTreeSet<String>,
    network: NetworkPolicy,
    limits: ResourceLimits,
}

impl SandboxSpecBuilder {
    /// Declare a readable input path.
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(path.into());
        self
    }

    /// Declare several input paths.
    pub fn inputs<I: IntoIterator<Item = PathBuf>>(mut self, paths: I) -> Self {
        self.inputs.extend(paths);
        self
    }

    /// Declare a writable output path.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.insert(path.into());
        self
    }

    /// Declare several output paths.
    pub fn outputs<I: IntoIterator<Item = PathBuf>>(mut self, paths: I) -> Self {
        self.outputs.extend(paths);
        self
    }

    /// Declare a scratch directory.
    pub fn temp(mut self, path: impl Into<PathBuf>) -> Self {
        self.temps.insert(path.into());
        self
    }

    /// Whitelist one environment entry.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Explicitly permit a hermeticity-sensitive env key (e.g.
    /// `SOURCE_DATE_EPOCH` passthrough, or `HOME` for a tool that insists).
    pub fn permit_env(mut self, key: impl Into<String>) -> Self {
        self.permitted_env.insert(key.into());
        self
    }

    /// Set the network policy (default: denied).
    pub fn network(mut self, policy: NetworkPolicy) -> Self {
        self.network = policy;
        self
    }

    /// Set resource limits (default: unlimited).
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Validate and produce the spec, reporting **all** violations.
    ///
    /// # Errors
    ///
    /// [`InvalidSpec`] listing every violation found.
    pub fn build(self) -> Result<SandboxSpec, InvalidSpec> {
        let mut violations = Vec::new();

        for path in self.outputs.intersection(&self.inputs) {
            violations.push(SpecViolation::OutputOverlapsInput(path.clone()));
        }
        for path in self.outputs.intersection(&self.temps) {
            violations.push(SpecViolation::OutputOverlapsTemp(path.clone()));
        }
        for key in self.env.keys() {
            let sensitive = HERMETIC_DENY_KEYS.contains(&key.as_str())
                || key.starts_with("SOURCE_DATE_");
            if sensitive && !self.permitted_env.contains(key) {
                violations.push(SpecViolation::ForbiddenEnvKey(key.clone()));
            }
        }
        if self.limits.memory_bytes == Some(0) {
            violations.push(SpecViolation::NonPositiveLimit("memory"));
        }
        if self.limits.cpu_ms == Some(0) {
            violations.push(SpecViolation::NonPositiveLimit("cpu"));
        }
        if self.limits.wall == Some(Duration::ZERO) {
            violations.push(SpecViolation::NonPositiveLimit("wall"));
        }

        if violations.is_empty() {
            Ok(SandboxSpec {
                inputs: self.inputs,
                outputs: self.outputs,
                temps: self.temps,
                env: self.env,
                network: self.network,
                limits: self.limits,
            })
        } else {
            Err(InvalidSpec { violations })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn minimal_valid_spec_builds() {
        let spec = SandboxSpec::builder()
            .input("src/main.c")
            .output("main.o")
            .build()
            .unwrap();
        assert_eq!(spec.inputs().count(), 1);
        assert_eq!(spec.network(), NetworkPolicy::Denied);
    }

    #[test]
    fn zero_output_spec_is_legal() {
        // Side-effect-only actions (lints, notifications) declare inputs and
        // nothing else; their action key is still well defined.
        let spec = SandboxSpec::builder()
            .input("src/main.c")
            .build()
            .unwrap();
        assert_eq!(spec.outputs().count(), 0);
    }

    #[test]
    fn output_as_its_own_input_is_rejected() {
        let err = SandboxSpec::builder()
            .input("main.o")
            .output("main.o")
            .build()
            .unwrap_err();
        assert!(err
            .violations
            .contains(&SpecViolation::OutputOverlapsInput(PathBuf::from("main.o"))));
    }

    #[test]
    fn all_violations_are_reported_not_just_the_first() {
        let err = SandboxSpec::builder()
            .input("clash")
            .output("clash")
            .env("HOME", "/root")
            .limits(ResourceLimits {
                memory_bytes: Some(0),
                cpu_ms: None,
                wall: None,
            })
            .build()
            .unwrap_err();
        assert!(err.violations.len() >= 3, "got {:?}", err.violations);
    }

    #[test]
    fn permitted_env_key_passes() {
        let spec = SandboxSpec::builder()
            .output("out")
            .env("SOURCE_DATE_EPOCH", "0")
            .permit_env("SOURCE_DATE_EPOCH")
            .env("CC", "clang")
            .build()
            .unwrap();
        assert_eq!(spec.env().get("SOURCE_DATE_EPOCH").map(String::as_str), Some("0"));
    }

    #[test]
    fn forbidden_env_without_permit_is_rejected() {
        let err = SandboxSpec::builder()
            .output("out")
            .env("USER", "nobody")
            .build()
            .unwrap_err();
        assert_eq!(
            err.violations,
            vec![SpecViolation::ForbiddenEnvKey("USER".to_owned())]
        );
    }

    #[test]
    fn zero_limits_are_rejected_unlimited_is_none() {
        let err = SandboxSpec::builder()
            .output("out")
            .limits(ResourceLimits {
                memory_bytes: Some(0),
                cpu_ms: Some(0),
                wall: Some(Duration::ZERO),
            })
            .build()
            .unwrap_err();
        assert_eq!(err.violations.len(), 3);

        assert!(SandboxSpec::builder()
            .output("out")
            .limits(ResourceLimits::default())
            .build()
            .is_ok());
    }
}
