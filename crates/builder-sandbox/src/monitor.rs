// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Resource usage monitoring for sandboxed children.
//!
//! The monitor samples the child while it runs (peak RSS and CPU time from
//! `/proc` on Linux; wall time everywhere) and evaluates limits when stopped.
//! Wall-clock enforcement is the executor's job — it kills on deadline — but
//! the monitor still reports the violation so diagnostics are uniform.

use std::fmt;
use std::time::{Duration, Instant};

use crate::spec::ResourceLimits;

/// Which limit a violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Peak resident memory.
    Memory,
    /// CPU time.
    Cpu,
    /// Wall-clock time.
    Wall,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Cpu => write!(f, "cpu"),
            Self::Wall => write!(f, "wall"),
        }
    }
}

/// A structured limit violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// The limit that was exceeded.
    pub kind: LimitKind,
    /// Observed value (bytes or milliseconds).
    pub actual: u64,
    /// Configured ceiling (bytes or milliseconds).
    pub limit: u64,
    /// Human-readable summary.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// What the monitor observed over one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Peak resident set size, when the platform exposes it.
    pub peak_memory_bytes: Option<u64>,
    /// CPU time in milliseconds, when the platform exposes it.
    pub cpu_ms: Option<u64>,
    /// Wall-clock duration (always measured).
    pub wall: Duration,
}

/// Samples one child process between `start` and `stop`.
#[derive(Debug)]
pub struct ResourceMonitor {
    started: Instant,
    pid: u32,
    peak_memory_bytes: Option<u64>,
    cpu_ms: Option<u64>,
}

impl ResourceMonitor {
    /// Begin monitoring the child with OS pid `pid`.
    pub fn start(pid: u32) -> Self {
        Self {
            started: Instant::now(),
            pid,
            peak_memory_bytes: None,
            cpu_ms: None,
        }
    }

    /// Wall time elapsed so far (the executor's deadline clock).
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Take a sample. Called periodically by the executor's wait loop; a
    /// sample after process exit is a no-op.
    pub fn sample(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Some(peak) = read_proc_peak_rss(self.pid) {
                self.peak_memory_bytes = Some(self.peak_memory_bytes.unwrap_or(0).max(peak));
            }
            if let Some(cpu) = read_proc_cpu_ms(self.pid) {
                self.cpu_ms = Some(cpu);
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = self.pid;
        }
    }

    /// Stop monitoring and evaluate `limits`.
    ///
    /// Returns the usage summary and any violations. The executor terminates
    /// the child when it sees a hard violation mid-run; violations discovered
    /// only here (e.g. CPU observed at exit) still fail the action.
    pub fn stop(mut self, limits: &ResourceLimits) -> (ResourceUsage, Vec<Violation>) {
        self.sample();
        let usage = ResourceUsage {
            peak_memory_bytes: self.peak_memory_bytes,
            cpu_ms: self.cpu_ms,
            wall: self.started.elapsed(),
        };

        let mut violations = Vec::new();
        if let (Some(limit), Some(actual)) = (limits.memory_bytes, usage.peak_memory_bytes) {
            if actual > limit {
                violations.push(Violation {
                    kind: LimitKind::Memory,
                    actual,
                    limit,
                    message: format!("peak memory {actual} B exceeds limit {limit} B"),
                });
            }
        }
        if let (Some(limit), Some(actual)) = (limits.cpu_ms, usage.cpu_ms) {
            if actual > limit {
                violations.push(Violation {
                    kind: LimitKind::Cpu,
                    actual,
                    limit,
                    message: format!("cpu time {actual} ms exceeds limit {limit} ms"),
                });
            }
        }
        if let Some(limit) = limits.wall {
            let actual = usage.wall;
            if actual > limit {
                violations.push(Violation {
                    kind: LimitKind::Wall,
                    actual: u64::try_from(actual.as_millis()).unwrap_or(u64::MAX),
                    limit: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    message: format!(
                        "wall time {} ms exceeds limit {} ms",
                        actual.as_millis(),
                        limit.as_millis()
                    ),
                });
            }
        }
        (usage, violations)
    }
}

/// `VmHWM` from `/proc/<pid>/status`, in bytes.
#[cfg(target_os = "linux")]
fn read_proc_peak_rss(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// utime+stime from `/proc/<pid>/stat`, in milliseconds.
#[cfg(target_os = "linux")]
fn read_proc_cpu_ms(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields 14 and 15 (1-indexed) after the parenthesized comm, in clock
    // ticks. The comm may contain spaces, so split after the closing paren.
    let after = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    // Assume the near-universal 100 Hz tick.
    Some((utime + stime) * 10)
}
