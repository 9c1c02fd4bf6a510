// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Platform sandbox strategies.
//!
//! Each strategy turns a staged sandbox root plus a [`SandboxSpec`] into a
//! launchable [`Command`]. Strategies wrap existing platform tools rather
//! than binding raw syscalls:
//!
//! | Platform | Mechanism |
//! |----------|-----------|
//! | Linux    | `unshare` user/mount/pid/net/ipc/uts namespaces |
//! | macOS    | `sandbox-exec` with a generated SBPL profile |
//! | Windows  | best-effort: monitor-enforced limits, cwd isolation |
//! | Fallback | cwd isolation + env scrubbing (tests, exotic hosts) |
//!
//! Selection is `cfg`-gated with a runtime probe; a host without the platform
//! tool degrades to [`Strategy::Fallback`] with a warning, unless the caller
//! demands real hermeticity and turns the degrade into an error.

use std::path::Path;
use std::process::Command;

use tracing::warn;

use crate::spec::{NetworkPolicy, SandboxSpec};
use crate::ExecError;

/// The sandboxing mechanism in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Linux namespaces via `unshare`.
    LinuxNamespaces,
    /// macOS Seatbelt via `sandbox-exec`.
    MacosSeatbelt,
    /// Windows: monitor-enforced limits only.
    WindowsJobObject,
    /// No isolation beyond a private cwd and a scrubbed environment.
    Fallback,
}

impl Strategy {
    /// Pick the strongest strategy available on this host.
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            if probe("unshare") {
                return Self::LinuxNamespaces;
            }
            warn!("unshare unavailable, degrading to fallback sandbox");
            Self::Fallback
        }
        #[cfg(target_os = "macos")]
        {
            if probe("sandbox-exec") {
                return Self::MacosSeatbelt;
            }
            warn!("sandbox-exec unavailable, degrading to fallback sandbox");
            Self::Fallback
        }
        #[cfg(target_os = "windows")]
        {
            Self::WindowsJobObject
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            Self::Fallback
        }
    }

    /// Does this strategy actually isolate the filesystem and network?
    pub fn is_hermetic(self) -> bool {
        matches!(self, Self::LinuxNamespaces | Self::MacosSeatbelt)
    }

    /// Build the launch command for `tool argv…` inside `root`.
    ///
    /// The caller owns cwd, environment, and stdio configuration; this only
    /// decides the program and argument prefix (and, for Seatbelt, writes the
    /// profile file into the root).
    ///
    /// # Errors
    ///
    /// [`ExecError::SandboxFailed`] when strategy scaffolding (e.g. the SBPL
    /// profile) cannot be written.
    pub(crate) fn command(
        self,
        root: &Path,
        spec: &SandboxSpec,
        tool: &Path,
        argv: &[String],
    ) -> Result<Command, ExecError> {
        match self {
            Self::LinuxNamespaces => {
                let mut command = Command::new("unshare");
                command.args([
                    "--user",
                    "--map-root-user",
                    "--mount",
                    "--pid",
                    "--fork",
                    "--ipc",
                    "--uts",
                ]);
                if spec.network() == NetworkPolicy::Denied {
                    command.arg("--net");
                }
                command.arg("--");
                command.arg(tool);
                command.args(argv);
                Ok(command)
            }
            Self::MacosSeatbelt => {
                let profile = seatbelt_profile(root, spec);
                let profile_path = root.join(".sandbox.sb");
                std::fs::write(&profile_path, profile).map_err(|err| {
                    ExecError::SandboxFailed {
                        detail: format!("writing seatbelt profile: {err}"),
                    }
                })?;
                let mut command = Command::new("sandbox-exec");
                command.arg("-f");
                command.arg(&profile_path);
                command.arg(tool);
                command.args(argv);
                Ok(command)
            }
            Self::WindowsJobObject | Self::Fallback => {
                let mut command = Command::new(tool);
                command.args(argv);
                Ok(command)
            }
        }
    }
}

/// Generate an SBPL profile allowing only declared reads/writes plus system
/// frameworks.
fn seatbelt_profile(root: &Path, spec: &SandboxSpec) -> String {
    let root_display = root.display();
    let mut profile = String::new();
    profile.push_str("(version 1)\n(deny default)\n");
    profile.push_str("(allow process-exec)\n(allow process-fork)\n(allow sysctl-read)\n");
    profile.push_str(
        "(allow file-read* (subpath \"/usr\") (subpath \"/System\") (subpath \"/Library\") (subpath \"/private/var/db/dyld\"))\n",
    );
    profile.push_str(&format!("(allow file-read* (subpath \"{root_display}\"))\n"));
    profile.push_str(&format!("(allow file-write* (subpath \"{root_display}\"))\n"));
    if spec.network() != NetworkPolicy::Denied {
        profile.push_str("(allow network*)\n");
    }
    profile
}

/// Can `program --version` be spawned at all?
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn probe(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok()
}
