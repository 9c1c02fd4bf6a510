// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Immutable build-target descriptions.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::TargetId;

/// What a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// A runnable program.
    Executable,
    /// A linkable library.
    Library,
    /// A test binary; `builder test` runs it after building.
    Test,
    /// An arbitrary command with declared inputs and outputs.
    Custom,
}

/// A single build target as declared in the workspace.
///
/// Targets are created at graph-build time and immutable for the duration of a
/// build invocation. Dependencies are labels, resolved against the workspace
/// when the graph is assembled; unresolved labels are a configuration error,
/// not a panic.
#[derive(Debug, Clone)]
pub struct Target {
    /// Unique identity within the workspace.
    pub id: TargetId,
    /// What the target produces.
    pub kind: TargetKind,
    /// Language tag used to select a handler (e.g. `"c"`, `"rust"`, `"sh"`).
    pub language: String,
    /// Source files, relative to the workspace root.
    pub srcs: Vec<PathBuf>,
    /// Static dependencies on other targets.
    pub deps: Vec<TargetId>,
    /// Tool binary that builds this target (resolved by the handler).
    pub tool: PathBuf,
    /// Compile/link flags passed through to the tool.
    pub flags: Vec<String>,
    /// Extra environment entries the action is allowed to see. Sorted map so
    /// the action key derivation is order-independent by construction.
    pub env: BTreeMap<String, String>,
    /// Declared output paths, relative to the workspace root.
    pub outs: Vec<PathBuf>,
}

impl Target {
    /// Convenience constructor with empty attribute sets.
    pub fn new(id: TargetId, kind: TargetKind, language: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            language: language.into(),
            srcs: Vec::new(),
            deps: Vec::new(),
            tool: PathBuf::new(),
            flags: Vec::new(),
            env: BTreeMap::new(),
            outs: Vec::new(),
        }
    }
}
