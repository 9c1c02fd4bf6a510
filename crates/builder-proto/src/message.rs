// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Protocol message kinds and their payload schemas.

use std::collections::BTreeMap;
use std::path::PathBuf;

use builder_cache::ActionId;
use builder_cas::Digest;
use builder_sandbox::{NetworkPolicy, ResourceLimits, SandboxSpec};

use crate::codec::{Reader, Writer};
use crate::WireError;

/// Opaque 64-bit worker identity, unique in coordinator scope.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{:016x}", self.0)
    }
}

/// The command half of a dispatched action (the sandbox spec is the policy
/// half).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCommand {
    /// Tool to invoke.
    pub tool: PathBuf,
    /// Argument vector, order-significant.
    pub argv: Vec<String>,
    /// Whitelisted environment.
    pub env: BTreeMap<String, String>,
}

/// Execution metrics reported with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireMetrics {
    /// Wall time in milliseconds.
    pub wall_ms: u64,
    /// Peak resident memory, when measured.
    pub peak_memory_bytes: Option<u64>,
    /// CPU time in milliseconds, when measured.
    pub cpu_ms: Option<u64>,
}

/// All protocol messages. Opcode values are part of the wire contract.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Worker → coordinator: registration with execution capacity.
    Hello {
        /// The worker's self-assigned identity.
        worker: WorkerId,
        /// Parallel actions the worker will accept.
        capacity: u32,
    },
    /// Coordinator → worker: execute an action.
    Enqueue {
        /// The action key (dedup point across the fleet).
        action: ActionId,
        /// What to run.
        command: WireCommand,
        /// What the action may touch.
        spec: SandboxSpec,
        /// Content digests of every input, pulled lazily via `FetchBlob`.
        input_digests: Vec<(PathBuf, Digest)>,
    },
    /// Worker → peer: request work when idle.
    Steal {
        /// The requesting worker.
        from_worker: WorkerId,
        /// Upper bound on actions to hand over.
        max: u32,
    },
    /// Worker → coordinator: an action finished.
    ActionResult {
        /// The action key.
        action: ActionId,
        /// Output path → digest pairs (blobs pushed via `PutBlob`).
        outputs: Vec<(PathBuf, Digest)>,
        /// Exit code.
        exit: i32,
        /// Digest of captured stderr.
        stderr_digest: Digest,
        /// Execution metrics.
        metrics: WireMetrics,
    },
    /// Either direction: request a blob by digest.
    FetchBlob {
        /// The wanted digest.
        digest: Digest,
    },
    /// Either direction: deliver a blob.
    PutBlob {
        /// Digest of `bytes` (verified on receipt).
        digest: Digest,
        /// Blob contents.
        bytes: Vec<u8>,
    },
    /// Worker → coordinator: liveness plus load.
    Heartbeat {
        /// The reporting worker.
        worker: WorkerId,
        /// Actions queued locally.
        queue_depth: u32,
        /// Smoothed load metric (EMA of wall time, unitless).
        load: f64,
    },
    /// Coordinator → worker: abort an in-flight action.
    AbortAction {
        /// The action to abort.
        action: ActionId,
    },
    /// Positive acknowledgement (correlated via the frame header).
    Ack,
    /// Protocol-level failure (correlated via the frame header).
    Error {
        /// Stable numeric code.
        code: u32,
        /// Human-readable detail.
        message: String,
    },
}

impl Message {
    /// Wire opcode for this message.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Hello { .. } => 0x01,
            Self::Enqueue { .. } => 0x02,
            Self::Steal { .. } => 0x03,
            Self::ActionResult { .. } => 0x04,
            Self::FetchBlob { .. } => 0x05,
            Self::PutBlob { .. } => 0x06,
            Self::Heartbeat { .. } => 0x07,
            Self::AbortAction { .. } => 0x08,
            Self::Ack => 0x09,
            Self::Error { .. } => 0x0A,
        }
    }

    /// Encode the payload (everything after the frame header).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::Hello { worker, capacity } => {
                w.put_varint(worker.0);
                w.put_varint(u64::from(*capacity));
            }
            Self::Enqueue {
                action,
                command,
                spec,
                input_digests,
            } => {
                w.put_digest(&action.0);
                put_command(&mut w, command);
                put_spec(&mut w, spec);
                w.put_varint(input_digests.len() as u64);
                for (path, digest) in input_digests {
                    put_path(&mut w, path);
                    w.put_digest(digest);
                }
            }
            Self::Steal { from_worker, max } => {
                w.put_varint(from_worker.0);
                w.put_varint(u64::from(*max));
            }
            Self::ActionResult {
                action,
                outputs,
                exit,
                stderr_digest,
                metrics,
            } => {
                w.put_digest(&action.0);
                w.put_varint(outputs.len() as u64);
                for (path, digest) in outputs {
                    put_path(&mut w, path);
                    w.put_digest(digest);
                }
                w.put_signed(i64::from(*exit));
                w.put_digest(stderr_digest);
                w.put_varint(metrics.wall_ms);
                put_opt_varint(&mut w, metrics.peak_memory_bytes);
                put_opt_varint(&mut w, metrics.cpu_ms);
            }
            Self::FetchBlob { digest } => w.put_digest(digest),
            Self::PutBlob { digest, bytes } => {
                w.put_digest(digest);
                w.put_bytes(bytes);
            }
            Self::Heartbeat {
                worker,
                queue_depth,
                load,
            } => {
                w.put_varint(worker.0);
                w.put_varint(u64::from(*queue_depth));
                w.put_f64(*load);
            }
            Self::AbortAction { action } => w.put_digest(&action.0),
            Self::Ack => {}
            Self::Error { code, message } => {
                w.put_varint(u64::from(*code));
                w.put_str(message);
            }
        }
        w.into_bytes()
    }

    /// Decode a payload for `opcode`. The reader must be fully consumed.
    ///
    /// # Errors
    ///
    /// Any [`WireError`] from malformed or trailing payload bytes.
    pub fn decode_payload(opcode: u8, payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let message = match opcode {
            0x01 => Self::Hello {
                worker: WorkerId(r.varint()?),
                capacity: narrow_u32(r.varint()?)?,
            },
            0x02 => Self::Enqueue {
                action: ActionId(r.digest()?),
                command: take_command(&mut r)?,
                spec: take_spec(&mut r)?,
                input_digests: {
                    let count = r.varint()?;
                    let mut pairs = Vec::new();
                    for _ in 0..count {
                        let path = take_path(&mut r)?;
                        let digest = r.digest()?;
                        pairs.push((path, digest));
                    }
                    pairs
                },
            },
            0x03 => Self::Steal {
                from_worker: WorkerId(r.varint()?),
                max: narrow_u32(r.varint()?)?,
            },
            0x04 => {
                let action = ActionId(r.digest()?);
                let count = r.varint()?;
                let mut outputs = Vec::new();
                for _ in 0..count {
                    let path = take_path(&mut r)?;
                    let digest = r.digest()?;
                    outputs.push((path, digest));
                }
                let exit = i32::try_from(r.signed()?).map_err(|_| WireError::ValueOutOfRange)?;
                let stderr_digest = r.digest()?;
                let metrics = WireMetrics {
                    wall_ms: r.varint()?,
                    peak_memory_bytes: take_opt_varint(&mut r)?,
                    cpu_ms: take_opt_varint(&mut r)?,
                };
                Self::ActionResult {
                    action,
                    outputs,
                    exit,
                    stderr_digest,
                    metrics,
                }
            }
            0x05 => Self::FetchBlob {
                digest: r.digest()?,
            },
            0x06 => Self::PutBlob {
                digest: r.digest()?,
                bytes: r.bytes()?.to_vec(),
            },
            0x07 => Self::Heartbeat {
                worker: WorkerId(r.varint()?),
                queue_depth: narrow_u32(r.varint()?)?,
                load: r.f64()?,
            },
            0x08 => Self::AbortAction {
                action: ActionId(r.digest()?),
            },
            0x09 => Self::Ack,
            0x0A => Self::Error {
                code: narrow_u32(r.varint()?)?,
                message: r.string()?,
            },
            other => return Err(WireError::UnknownOpcode(other)),
        };
        r.finish()?;
        Ok(message)
    }
}

fn put_command(w: &mut Writer, command: &WireCommand) {
    put_path(w, &command.tool);
    w.put_varint(command.argv.len() as u64);
    for arg in &command.argv {
        w.put_str(arg);
    }
    w.put_varint(command.env.len() as u64);
    for (key, value) in &command.env {
        w.put_str(key);
        w.put_str(value);
    }
}

fn take_command(r: &mut Reader<'_>) -> Result<WireCommand, WireError> {
    let tool = take_path(r)?;
    let argc = r.varint()?;
    let mut argv = Vec::new();
    for _ in 0..argc {
        argv.push(r.string()?);
    }
    let envc = r.varint()?;
    let mut env = BTreeMap::new();
    for _ in 0..envc {
        let key = r.string()?;
        let value = r.string()?;
        env.insert(key, value);
    }
    Ok(WireCommand { tool, argv, env })
}

/// Sandbox specs travel as their field sets and are revalidated through the
/// builder on decode, so a malformed peer cannot smuggle an inconsistent
/// spec past `build()`.
fn put_spec(w: &mut Writer, spec: &SandboxSpec) {
    let inputs: Vec<_> = spec.inputs().collect();
    w.put_varint(inputs.len() as u64);
    for path in inputs {
        put_path(w, path);
    }
    let outputs: Vec<_> = spec.outputs().collect();
    w.put_varint(outputs.len() as u64);
    for path in outputs {
        put_path(w, path);
    }
    let temps: Vec<_> = spec.temps().collect();
    w.put_varint(temps.len() as u64);
    for path in temps {
        put_path(w, path);
    }
    w.put_varint(spec.env().len() as u64);
    for (key, value) in spec.env() {
        w.put_str(key);
        w.put_str(value);
    }
    w.put_varint(match spec.network() {
        NetworkPolicy::Denied => 0,
        NetworkPolicy::Loopback => 1,
        NetworkPolicy::Full => 2,
    });
    let limits = spec.limits();
    put_opt_varint(w, limits.memory_bytes);
    put_opt_varint(w, limits.cpu_ms);
    put_opt_varint(
        w,
        limits
            .wall
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
    );
}

fn take_spec(r: &mut Reader<'_>) -> Result<SandboxSpec, WireError> {
    let mut builder = SandboxSpec::builder();
    for _ in 0..r.varint()? {
        builder = builder.input(take_path(r)?);
    }
    for _ in 0..r.varint()? {
        builder = builder.output(take_path(r)?);
    }
    for _ in 0..r.varint()? {
        builder = builder.temp(take_path(r)?);
    }
    for _ in 0..r.varint()? {
        let key = r.string()?;
        let value = r.string()?;
        // The sender already validated; re-permit so revalidation agrees.
        builder = builder.permit_env(key.clone()).env(key, value);
    }
    builder = builder.network(match r.varint()? {
        0 => NetworkPolicy::Denied,
        1 => NetworkPolicy::Loopback,
        2 => NetworkPolicy::Full,
        other => return Err(WireError::InvalidNetworkPolicy(other)),
    });
    let memory_bytes = take_opt_varint(r)?;
    let cpu_ms = take_opt_varint(r)?;
    let wall = take_opt_varint(r)?.map(std::time::Duration::from_millis);
    builder = builder.limits(ResourceLimits {
        memory_bytes,
        cpu_ms,
        wall,
    });
    builder
        .build()
        .map_err(|err| WireError::InvalidSpec(err.to_string()))
}

/// `Option<u64>` as presence byte + varint.
fn put_opt_varint(w: &mut Writer, value: Option<u64>) {
    match value {
        Some(v) => {
            w.put_bool(true);
            w.put_varint(v);
        }
        None => w.put_bool(false),
    }
}

fn take_opt_varint(r: &mut Reader<'_>) -> Result<Option<u64>, WireError> {
    if r.boolean()? {
        Ok(Some(r.varint()?))
    } else {
        Ok(None)
    }
}

/// Paths travel as UTF-8 with `/` separators.
fn put_path(w: &mut Writer, path: &std::path::Path) {
    w.put_str(&path.to_string_lossy());
}

fn take_path(r: &mut Reader<'_>) -> Result<PathBuf, WireError> {
    Ok(PathBuf::from(r.string()?))
}

fn narrow_u32(value: u64) -> Result<u32, WireError> {
    u32::try_from(value).map_err(|_| WireError::ValueOutOfRange)
}
