// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Graph construction and mutation errors.

use builder_model::TargetId;

/// Errors raised while building or mutating the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A target with the same identity was already added.
    #[error("duplicate target {0}")]
    DuplicateTarget(TargetId),

    /// A dependency label did not resolve to a known target.
    #[error("target {target} depends on unknown target {dep}")]
    UnknownDependency {
        /// The target whose dependency list is broken.
        target: TargetId,
        /// The unresolved label.
        dep: TargetId,
    },

    /// The graph contains a cycle.
    ///
    /// `nodes` lists the participating identities in cycle order, with the
    /// first node repeated at the end (`[A, B, C, A]`; a self-loop reports
    /// `[A, A]`).
    #[error("dependency cycle: {}", format_cycle(nodes))]
    CycleDetected {
        /// Cycle path, closed (first node repeated last).
        nodes: Vec<TargetId>,
    },

    /// A dynamic dependency would target a node that already succeeded.
    ///
    /// Such an edge can never be observed by the parent's current execution
    /// and would corrupt in-degree accounting.
    #[error("dynamic dep from {parent} to already-finished {dep}")]
    DynamicDepFinished {
        /// The executing node that discovered the dep.
        parent: TargetId,
        /// The node that is already `Success`.
        dep: TargetId,
    },

    /// The graph was mutated after `resolve`, or queried before it.
    #[error("operation requires a resolved graph")]
    NotResolved,
}

fn format_cycle(nodes: &[TargetId]) -> String {
    nodes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
