// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Node handles and the atomic per-node state machine.

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use builder_model::TargetId;

/// Opaque handle to a node in a [`DepGraph`](crate::DepGraph).
///
/// Handles are dense indices; they are only meaningful against the graph that
/// issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(pub(crate) usize);

impl NodeRef {
    /// Dense index of this node, usable for per-node side tables.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Lifecycle of a node during one build invocation.
///
/// ```text
/// Pending → Ready → Running → {Success, Failed}
///                              Failed → Ready   (explicit retry only)
/// Pending/Ready → Skipped                       (terminal)
/// ```
///
/// All transitions go through compare-and-swap; status never moves backwards
/// except via [`DepGraph::retry`](crate::DepGraph::retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeStatus {
    /// Waiting on at least one dependency.
    Pending = 0,
    /// All dependencies satisfied; claimable by a worker.
    Ready = 1,
    /// An action for this node is executing.
    Running = 2,
    /// Terminal: the action succeeded (or was a cache hit).
    Success = 3,
    /// The action failed; may return to Ready via retry.
    Failed = 4,
    /// Terminal: an upstream dependency failed under fail-fast.
    Skipped = 5,
}

impl NodeStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Success,
            4 => Self::Failed,
            _ => Self::Skipped,
        }
    }

    /// Terminal states never transition again (except Failed via retry).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

/// Per-node storage: identity plus the atomic lifecycle fields.
///
/// Adjacency lives in the graph-level edge tables, not here, so that the
/// dynamic-dep writer can take one lock over the whole edge structure.
#[derive(Debug)]
pub(crate) struct NodeSlot {
    pub(crate) id: TargetId,
    status: AtomicU8,
    pub(crate) in_degree: AtomicUsize,
    pub(crate) attempts: AtomicU32,
}

impl NodeSlot {
    pub(crate) fn new(id: TargetId) -> Self {
        Self {
            id,
            status: AtomicU8::new(NodeStatus::Pending as u8),
            in_degree: AtomicUsize::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    pub(crate) fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// CAS transition. Returns `true` iff this caller performed the move.
    pub(crate) fn transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use builder_model::TargetId;

    #[test]
    fn transition_is_exactly_once() {
        let slot = NodeSlot::new(TargetId::parse("//x:y").unwrap_or_else(|_| unreachable!()));
        assert!(slot.transition(NodeStatus::Pending, NodeStatus::Ready));
        assert!(!slot.transition(NodeStatus::Pending, NodeStatus::Ready));
        assert_eq!(slot.status(), NodeStatus::Ready);
    }

    #[test]
    fn terminal_classification() {
        assert!(NodeStatus::Success.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }
}
