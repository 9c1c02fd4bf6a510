// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `LanguageHandler` seam between the execution core and per-language
//! command construction.
//!
//! The core never builds a compiler invocation itself. It asks the handler for
//! an [`ActionPlan`] — the fully specified tool, argv, environment, inputs,
//! and outputs — and executes that plan hermetically. Handlers are a
//! capability set behind one trait; there is no handler class hierarchy.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{Target, TargetId, Workspace};

/// Errors a handler can produce while planning an action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The target's tool attribute is empty or unresolvable.
    #[error("target {0} declares no tool")]
    ToolNotFound(TargetId),

    /// A dependency label did not resolve to a known target.
    #[error("target {target} depends on unknown target {dep}")]
    UnknownDependency {
        /// The target whose dependency list is broken.
        target: TargetId,
        /// The unresolved label.
        dep: TargetId,
    },

    /// The handler does not support the target's language tag.
    #[error("no handler capability for language {language:?} (target {target})")]
    UnsupportedLanguage {
        /// The target that asked.
        target: TargetId,
        /// The unsupported language tag.
        language: String,
    },
}

/// An import discovered by source analysis (e.g. a `#include` header).
///
/// Imports feed dynamic dependency discovery: the scheduler attaches them as
/// additional inputs of the consuming node so later edits force a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Workspace-relative path of the discovered input.
    pub path: PathBuf,
}

/// A fully specified action: one tool invocation with explicit inputs,
/// argv, environment, and declared outputs.
///
/// Everything the action cache hashes and everything the sandbox allows comes
/// from this plan — if it is not listed here, the action cannot read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPlan {
    /// Tool binary to invoke.
    pub tool: PathBuf,
    /// Arguments, in order. Order is significant and is hashed as-is.
    pub argv: Vec<String>,
    /// Environment subset the action may see (already whitelisted).
    pub env: BTreeMap<String, String>,
    /// Workspace-relative input paths (sources plus dependency outputs).
    pub inputs: Vec<PathBuf>,
    /// Workspace-relative declared output paths.
    pub outputs: Vec<PathBuf>,
}

/// Capability set for per-language build logic.
///
/// Implementations must be cheap to call: `build` runs once per scheduled
/// node, and `outputs` feeds sandbox spec construction on every execution.
pub trait LanguageHandler: Send + Sync {
    /// Construct the action that builds `target`.
    ///
    /// The returned plan is executed hermetically by the core; its digest
    /// participates in the action key.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the target cannot be planned (missing
    /// tool, unresolved dependency, unsupported language).
    fn build(&self, target: &Target, workspace: &Workspace) -> Result<ActionPlan, HandlerError>;

    /// Optional fast-path hint. The action cache is authoritative; returning
    /// `true` here never forces a rebuild on its own.
    fn needs_rebuild(&self, _target: &Target, _workspace: &Workspace) -> bool {
        true
    }

    /// Declared output paths for `target`, used in sandbox spec construction.
    fn outputs(&self, target: &Target, _workspace: &Workspace) -> Vec<PathBuf> {
        target.outs.clone()
    }

    /// Scan sources for imports, feeding dynamic dependency discovery.
    ///
    /// The default implementation discovers nothing.
    fn analyze_imports(&self, _sources: &[PathBuf]) -> Vec<Import> {
        Vec::new()
    }
}

/// Generic argv-based handler: builds `tool flags... srcs...` with the
/// target's declared environment and outputs.
///
/// This is the handler used for `Custom` targets and for tests; language
/// plugins provide richer planning but flow through the same trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandHandler;

impl LanguageHandler for CommandHandler {
    fn build(&self, target: &Target, workspace: &Workspace) -> Result<ActionPlan, HandlerError> {
        if target.tool.as_os_str().is_empty() {
            return Err(HandlerError::ToolNotFound(target.id.clone()));
        }
        let mut argv = target.flags.clone();
        argv.extend(
            target
                .srcs
                .iter()
                .map(|p| p.to_string_lossy().into_owned()),
        );

        // Inputs are the target's own sources plus every dependency's
        // declared outputs; an unresolved dependency is a planning error.
        let mut inputs = target.srcs.clone();
        for dep in &target.deps {
            let dep_target =
                workspace
                    .target(dep)
                    .ok_or_else(|| HandlerError::UnknownDependency {
                        target: target.id.clone(),
                        dep: dep.clone(),
                    })?;
            inputs.extend(dep_target.outs.iter().cloned());
        }

        Ok(ActionPlan {
            tool: target.tool.clone(),
            argv,
            env: target.env.clone(),
            inputs,
            outputs: target.outs.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{TargetKind, Workspace};

    fn fixture() -> Workspace {
        let mut ws = Workspace::new("/tmp/ws");
        let mut dep = Target::new(
            TargetId::parse("//lib:core").unwrap(),
            TargetKind::Library,
            "c",
        );
        dep.outs = vec![PathBuf::from("lib/core.a")];
        ws.add_target(dep);

        let mut top = Target::new(
            TargetId::parse("//app:main").unwrap(),
            TargetKind::Executable,
            "c",
        );
        top.tool = PathBuf::from("cc");
        top.srcs = vec![PathBuf::from("app/main.c")];
        top.deps = vec![TargetId::parse("//lib:core").unwrap()];
        top.flags = vec!["-O2".to_owned()];
        top.outs = vec![PathBuf::from("app/main")];
        ws.add_target(top);
        ws
    }

    #[test]
    fn plan_includes_dep_outputs_as_inputs() {
        let ws = fixture();
        let target = ws.target(&TargetId::parse("//app:main").unwrap()).unwrap();
        let plan = CommandHandler.build(target, &ws).unwrap();
        assert_eq!(plan.tool, PathBuf::from("cc"));
        assert_eq!(plan.argv, vec!["-O2", "app/main.c"]);
        assert!(plan.inputs.contains(&PathBuf::from("app/main.c")));
        assert!(plan.inputs.contains(&PathBuf::from("lib/core.a")));
        assert_eq!(plan.outputs, vec![PathBuf::from("app/main")]);
    }

    #[test]
    fn unknown_dep_is_a_planning_error() {
        let mut ws = Workspace::new("/tmp/ws");
        let mut t = Target::new(
            TargetId::parse("//app:main").unwrap(),
            TargetKind::Executable,
            "c",
        );
        t.tool = PathBuf::from("cc");
        t.deps = vec![TargetId::parse("//missing:dep").unwrap()];
        ws.add_target(t);
        let target = ws.target(&TargetId::parse("//app:main").unwrap()).unwrap();
        assert!(matches!(
            CommandHandler.build(target, &ws),
            Err(HandlerError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn missing_tool_is_reported() {
        let mut ws = Workspace::new("/tmp/ws");
        ws.add_target(Target::new(
            TargetId::parse("//app:main").unwrap(),
            TargetKind::Custom,
            "sh",
        ));
        let target = ws.target(&TargetId::parse("//app:main").unwrap()).unwrap();
        assert!(matches!(
            CommandHandler.build(target, &ws),
            Err(HandlerError::ToolNotFound(_))
        ));
    }
}
