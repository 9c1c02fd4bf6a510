// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Dependency DAG for the build execution core.
//!
//! The graph owns one [`NodeSlot`] per target and two edge tables (deps and
//! reverse deps). Construction is single-threaded (`&mut self`); during
//! execution the graph is read-only except for
//! [`attach_dynamic_deps`](DepGraph::attach_dynamic_deps), which serializes
//! writers per parent node and validates acyclicity under the edge-table
//! write lock. Node lifecycle moves through an atomic state machine so that
//! exactly one worker wins each transition.
//!
//! # Validation modes
//!
//! - [`Validation::Immediate`] — every added edge is cycle-checked on insert
//!   (O(V) per edge, O(V²) overall). Dependencies must already exist. Suited
//!   to interactive editing where errors should surface on the offending
//!   edit.
//! - [`Validation::Deferred`] — labels may reference targets added later; one
//!   O(V+E) DFS at [`resolve`](DepGraph::resolve) detects cycles and yields
//!   the topological order. Suited to batch workspace loads.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod error;
mod node;

pub use error::GraphError;
pub use node::{NodeRef, NodeStatus};

use std::sync::atomic::Ordering;
use std::sync::{Mutex, OnceLock, RwLock};

use builder_model::{Target, TargetId};
use node::NodeSlot;
use rustc_hash::FxHashMap;

/// When cycle validation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Check each edge on insert; dependencies must already exist.
    Immediate,
    /// Check once at resolve time; forward references allowed.
    Deferred,
}

/// A topological order over the resolved graph.
///
/// For every edge `u → v` (u is a dependency of v), `u` appears before `v`.
#[derive(Debug, Clone)]
pub struct TopoOrder {
    order: Vec<NodeRef>,
}

impl TopoOrder {
    /// Nodes in dependency-first order.
    pub fn as_slice(&self) -> &[NodeRef] {
        &self.order
    }

    /// Iterate nodes in dependency-first order.
    pub fn iter(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.order.iter().copied()
    }

    /// Number of nodes in the order.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` for the empty graph.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Edge tables, guarded together so dynamic attachment sees a consistent
/// view for its cycle check.
#[derive(Debug, Default)]
struct Adjacency {
    /// `deps[v]` — prerequisite nodes of `v` (edges `u → v`).
    deps: Vec<Vec<NodeRef>>,
    /// `rdeps[u]` — nodes that depend on `u`.
    rdeps: Vec<Vec<NodeRef>>,
}

impl Adjacency {
    fn grow_to(&mut self, len: usize) {
        self.deps.resize_with(len, Vec::new);
        self.rdeps.resize_with(len, Vec::new);
    }

    fn insert(&mut self, dep: NodeRef, parent: NodeRef) {
        self.deps[parent.0].push(dep);
        self.rdeps[dep.0].push(parent);
    }

    fn has_edge(&self, dep: NodeRef, parent: NodeRef) -> bool {
        self.deps[parent.0].contains(&dep)
    }

    /// Is `to` reachable from `from` following forward (rdeps) edges?
    fn reaches(&self, from: NodeRef, to: NodeRef) -> bool {
        if from == to {
            return true;
        }
        let mut seen = vec![false; self.rdeps.len()];
        let mut stack = vec![from];
        seen[from.0] = true;
        while let Some(v) = stack.pop() {
            for &next in &self.rdeps[v.0] {
                if next == to {
                    return true;
                }
                if !seen[next.0] {
                    seen[next.0] = true;
                    stack.push(next);
                }
            }
        }
        false
    }
}

/// The build-target DAG.
pub struct DepGraph {
    mode: Validation,
    nodes: Vec<NodeSlot>,
    by_id: FxHashMap<TargetId, NodeRef>,
    adjacency: RwLock<Adjacency>,
    /// One lock per node, serializing dynamic attachment per parent.
    attach_locks: Vec<Mutex<()>>,
    /// Deferred-mode label edges awaiting resolution: `(parent, dep label)`.
    pending_labels: Vec<(NodeRef, TargetId)>,
    /// Longest-path-from-leaf per node, memoized at first query.
    depths: OnceLock<Vec<usize>>,
    resolved: bool,
}

impl std::fmt::Debug for DepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepGraph")
            .field("mode", &self.mode)
            .field("nodes", &self.nodes.len())
            .field("resolved", &self.resolved)
            .finish_non_exhaustive()
    }
}

impl DepGraph {
    /// Create an empty graph with the given validation mode.
    pub fn new(mode: Validation) -> Self {
        Self {
            mode,
            nodes: Vec::new(),
            by_id: FxHashMap::default(),
            adjacency: RwLock::new(Adjacency::default()),
            attach_locks: Vec::new(),
            pending_labels: Vec::new(),
            depths: OnceLock::new(),
            resolved: false,
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` for the empty graph.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate all node handles in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeRef> + '_ {
        (0..self.nodes.len()).map(NodeRef)
    }

    /// Identity of a node.
    pub fn node_id(&self, node: NodeRef) -> &TargetId {
        &self.nodes[node.0].id
    }

    /// Current lifecycle status of a node.
    pub fn status(&self, node: NodeRef) -> NodeStatus {
        self.nodes[node.0].status()
    }

    /// Look a node up by target identity.
    pub fn find(&self, id: &TargetId) -> Option<NodeRef> {
        self.by_id.get(id).copied()
    }

    /// Prerequisites of `node` (snapshot; dynamic deps may append later).
    pub fn deps_of(&self, node: NodeRef) -> Vec<NodeRef> {
        self.with_adjacency(|adj| adj.deps[node.0].clone())
    }

    /// Dependents of `node` (snapshot).
    pub fn rdeps_of(&self, node: NodeRef) -> Vec<NodeRef> {
        self.with_adjacency(|adj| adj.rdeps[node.0].clone())
    }

    /// Insert a node for `target` and record its dependency edges.
    ///
    /// # Errors
    ///
    /// - [`GraphError::DuplicateTarget`] if the identity already exists.
    /// - [`GraphError::UnknownDependency`] in Immediate mode when a dep label
    ///   is not yet present.
    /// - [`GraphError::CycleDetected`] in Immediate mode when an edge closes
    ///   a cycle.
    pub fn add_target(&mut self, target: &Target) -> Result<NodeRef, GraphError> {
        if self.by_id.contains_key(&target.id) {
            return Err(GraphError::DuplicateTarget(target.id.clone()));
        }
        let node = NodeRef(self.nodes.len());
        self.nodes.push(NodeSlot::new(target.id.clone()));
        self.attach_locks.push(Mutex::new(()));
        self.by_id.insert(target.id.clone(), node);
        self.adjacency
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .grow_to(self.nodes.len());

        for dep in &target.deps {
            match self.mode {
                Validation::Immediate => {
                    let dep_node =
                        self.find(dep)
                            .ok_or_else(|| GraphError::UnknownDependency {
                                target: target.id.clone(),
                                dep: dep.clone(),
                            })?;
                    self.insert_edge_checked(dep_node, node)?;
                }
                Validation::Deferred => {
                    self.pending_labels.push((node, dep.clone()));
                }
            }
        }
        Ok(node)
    }

    /// Add a single edge `dep → parent` between existing nodes.
    ///
    /// Used by interactive editors; `add_target` routes through the same
    /// insertion path.
    ///
    /// # Errors
    ///
    /// [`GraphError::CycleDetected`] in Immediate mode when the edge closes a
    /// cycle. In Deferred mode the check happens at `resolve`.
    pub fn add_edge(&mut self, dep: NodeRef, parent: NodeRef) -> Result<(), GraphError> {
        match self.mode {
            Validation::Immediate => self.insert_edge_checked(dep, parent),
            Validation::Deferred => {
                let dep_id = self.nodes[dep.0].id.clone();
                self.pending_labels.push((parent, dep_id));
                Ok(())
            }
        }
    }

    fn insert_edge_checked(&mut self, dep: NodeRef, parent: NodeRef) -> Result<(), GraphError> {
        let adj = self
            .adjacency
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if adj.has_edge(dep, parent) {
            return Ok(());
        }
        // Edge dep → parent cycles iff parent already reaches dep.
        if adj.reaches(parent, dep) {
            let nodes = self.cycle_path_through(parent, dep);
            return Err(GraphError::CycleDetected { nodes });
        }
        let adj = self
            .adjacency
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        adj.insert(dep, parent);
        self.nodes[parent.0].in_degree.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Reconstruct a closed cycle path `dep → parent → … → dep` for an edge
    /// rejected in Immediate mode.
    fn cycle_path_through(&self, parent: NodeRef, dep: NodeRef) -> Vec<TargetId> {
        // Find the existing parent → … → dep path via BFS parent pointers.
        let adj = self.read_adjacency();
        let mut prev: Vec<Option<NodeRef>> = vec![None; self.nodes.len()];
        let mut queue = std::collections::VecDeque::from([parent]);
        let mut found = parent == dep;
        while let Some(v) = queue.pop_front() {
            if found {
                break;
            }
            for &next in &adj.rdeps[v.0] {
                if prev[next.0].is_none() && next != parent {
                    prev[next.0] = Some(v);
                    if next == dep {
                        found = true;
                        break;
                    }
                    queue.push_back(next);
                }
            }
        }
        // Walk dep back to parent via prev pointers. Each hop `next → v`
        // reads "next depends on v", so the chain is already in depends-on
        // order; prefixing the rejected edge's parent closes the cycle.
        let mut chain = vec![dep];
        let mut cursor = dep;
        while cursor != parent {
            match prev[cursor.0] {
                Some(p) => {
                    chain.push(p);
                    cursor = p;
                }
                None => break,
            }
        }
        let mut nodes = Vec::with_capacity(chain.len() + 1);
        nodes.push(self.nodes[parent.0].id.clone());
        nodes.extend(chain.into_iter().map(|c| self.nodes[c.0].id.clone()));
        nodes
    }

    /// Resolve pending label edges (Deferred mode), verify acyclicity, and
    /// return a topological order.
    ///
    /// Idempotent per graph: after the first successful call the graph is
    /// sealed for structural edits other than dynamic attachment.
    ///
    /// # Errors
    ///
    /// - [`GraphError::UnknownDependency`] for unresolved labels.
    /// - [`GraphError::CycleDetected`] with the participating identities in
    ///   cycle order.
    pub fn resolve(&mut self) -> Result<TopoOrder, GraphError> {
        // Materialize deferred label edges.
        let pending = std::mem::take(&mut self.pending_labels);
        for (parent, dep_label) in pending {
            let dep = self
                .find(&dep_label)
                .ok_or_else(|| GraphError::UnknownDependency {
                    target: self.nodes[parent.0].id.clone(),
                    dep: dep_label.clone(),
                })?;
            let adj = self
                .adjacency
                .get_mut()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !adj.has_edge(dep, parent) {
                adj.insert(dep, parent);
                self.nodes[parent.0].in_degree.fetch_add(1, Ordering::AcqRel);
            }
        }

        let order = self.toposort()?;
        self.resolved = true;
        Ok(order)
    }

    /// Iterative three-color DFS over dep edges. Postorder is dependency-
    /// first, which is exactly the topological order we hand the scheduler.
    fn toposort(&self) -> Result<TopoOrder, GraphError> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let adj = self.read_adjacency();
        let n = self.nodes.len();
        let mut color = vec![WHITE; n];
        let mut order = Vec::with_capacity(n);

        for root in 0..n {
            if color[root] != WHITE {
                continue;
            }
            // Stack of (node, next dep index); `path` tracks gray nodes.
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            color[root] = GRAY;
            let mut path = vec![root];
            while let Some(&mut (v, ref mut i)) = stack.last_mut() {
                if *i < adj.deps[v].len() {
                    let child = adj.deps[v][*i].0;
                    *i += 1;
                    match color[child] {
                        WHITE => {
                            color[child] = GRAY;
                            stack.push((child, 0));
                            path.push(child);
                        }
                        GRAY => {
                            // Back edge. `path[start..]` is already the cycle
                            // in depends-on order; close it on the entry node.
                            let start = path
                                .iter()
                                .position(|&p| p == child)
                                .unwrap_or_default();
                            let mut nodes: Vec<TargetId> = path[start..]
                                .iter()
                                .map(|&p| self.nodes[p].id.clone())
                                .collect();
                            nodes.push(self.nodes[child].id.clone());
                            return Err(GraphError::CycleDetected { nodes });
                        }
                        _ => {}
                    }
                } else {
                    color[v] = BLACK;
                    order.push(NodeRef(v));
                    stack.pop();
                    path.pop();
                }
            }
        }
        Ok(TopoOrder { order })
    }

    /// Longest path from any leaf to `node`. Leaves have depth 0.
    ///
    /// Memoized on first call after `resolve`; the memo reflects the static
    /// graph at resolve time (dynamic deps do not refresh it).
    pub fn depth(&self, node: NodeRef) -> usize {
        let depths = self.depths.get_or_init(|| {
            // Order first, lock second: toposort takes the edge read lock
            // itself, and the std RwLock is not re-entrant.
            let order = self.toposort().ok();
            let adj = self.read_adjacency();
            let mut depth = vec![0usize; self.nodes.len()];
            // The graph is acyclic post-resolve; process in topo order.
            if let Some(order) = order {
                for v in order.iter() {
                    let best = adj.deps[v.0]
                        .iter()
                        .map(|d| depth[d.0] + 1)
                        .max()
                        .unwrap_or(0);
                    depth[v.0] = best;
                }
            }
            depth
        });
        depths[node.0]
    }

    /// Nodes whose in-degree is zero and status is `Pending`, transitioned
    /// atomically to `Ready`. Each node is returned by exactly one call.
    pub fn ready_frontier(&self) -> Vec<NodeRef> {
        let mut ready = Vec::new();
        for (i, slot) in self.nodes.iter().enumerate() {
            if slot.in_degree.load(Ordering::Acquire) == 0
                && slot.transition(NodeStatus::Pending, NodeStatus::Ready)
            {
                ready.push(NodeRef(i));
            }
        }
        ready
    }

    /// Claim a ready node for execution. Exactly one claimant wins.
    pub fn claim_running(&self, node: NodeRef) -> bool {
        self.nodes[node.0].transition(NodeStatus::Ready, NodeStatus::Running)
    }

    /// Mark `node` successful and decrement dependents' in-degrees.
    ///
    /// Returns the dependents that became ready — pushed, by convention, onto
    /// the completing worker's own queue for locality.
    pub fn complete_success(&self, node: NodeRef) -> Vec<NodeRef> {
        if !self.nodes[node.0].transition(NodeStatus::Running, NodeStatus::Success) {
            return Vec::new();
        }
        let dependents = self.rdeps_of(node);
        let mut newly_ready = Vec::new();
        for parent in dependents {
            // Subtract-then-test: the worker observing zero wins the Ready
            // transition; all others see a nonzero remainder.
            let remaining = self.nodes[parent.0].in_degree.fetch_sub(1, Ordering::AcqRel);
            if remaining == 1
                && self.nodes[parent.0].transition(NodeStatus::Pending, NodeStatus::Ready)
            {
                newly_ready.push(parent);
            }
        }
        newly_ready
    }

    /// Mark a running node failed.
    pub fn complete_failure(&self, node: NodeRef) -> bool {
        self.nodes[node.0].transition(NodeStatus::Running, NodeStatus::Failed)
    }

    /// Skip the downstream cone of a failed node (fail-fast policy).
    ///
    /// Every `Pending` or `Ready` transitive dependent transitions to
    /// `Skipped`; running and finished nodes are untouched. Returns the nodes
    /// skipped by this call.
    pub fn skip_cone(&self, from: NodeRef) -> Vec<NodeRef> {
        let mut skipped = Vec::new();
        let mut queue = std::collections::VecDeque::from([from]);
        while let Some(v) = queue.pop_front() {
            for parent in self.rdeps_of(v) {
                let slot = &self.nodes[parent.0];
                let moved = slot.transition(NodeStatus::Pending, NodeStatus::Skipped)
                    || slot.transition(NodeStatus::Ready, NodeStatus::Skipped);
                if moved {
                    skipped.push(parent);
                    queue.push_back(parent);
                }
            }
        }
        skipped
    }

    /// Reset a failed node to `Ready` for another attempt.
    ///
    /// This is the only path out of `Failed`. Returns the new attempt count,
    /// or `None` if the node was not `Failed`.
    pub fn retry(&self, node: NodeRef) -> Option<u32> {
        let slot = &self.nodes[node.0];
        if slot.transition(NodeStatus::Failed, NodeStatus::Ready) {
            Some(slot.attempts.fetch_add(1, Ordering::AcqRel) + 1)
        } else {
            None
        }
    }

    /// Attempt count for a node (number of retries performed).
    pub fn attempts(&self, node: NodeRef) -> u32 {
        self.nodes[node.0].attempts.load(Ordering::Acquire)
    }

    /// Attach dependencies discovered while `parent` executes (e.g. included
    /// headers reported by the action).
    ///
    /// Serialized per parent node; the acyclicity check runs under the edge
    /// write lock so no concurrent attachment can invalidate it. Attachment
    /// is all-or-nothing: on any rejection no edge from this call is kept.
    ///
    /// # Errors
    ///
    /// - [`GraphError::NotResolved`] before `resolve`.
    /// - [`GraphError::DynamicDepFinished`] if a dep already succeeded.
    /// - [`GraphError::CycleDetected`] if an edge would close a cycle.
    pub fn attach_dynamic_deps(
        &self,
        parent: NodeRef,
        deps: &[NodeRef],
    ) -> Result<(), GraphError> {
        if !self.resolved {
            return Err(GraphError::NotResolved);
        }
        let _parent_guard = self.attach_locks[parent.0]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut adj = self
            .adjacency
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Validate everything before inserting anything.
        let mut fresh = Vec::new();
        for &dep in deps {
            if adj.has_edge(dep, parent) || fresh.contains(&dep) {
                continue;
            }
            if self.nodes[dep.0].status() == NodeStatus::Success {
                return Err(GraphError::DynamicDepFinished {
                    parent: self.nodes[parent.0].id.clone(),
                    dep: self.nodes[dep.0].id.clone(),
                });
            }
            if adj.reaches(parent, dep) {
                return Err(GraphError::CycleDetected {
                    nodes: vec![
                        self.nodes[parent.0].id.clone(),
                        self.nodes[dep.0].id.clone(),
                        self.nodes[parent.0].id.clone(),
                    ],
                });
            }
            fresh.push(dep);
        }
        for dep in fresh {
            adj.insert(dep, parent);
            self.nodes[parent.0].in_degree.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn read_adjacency(&self) -> std::sync::RwLockReadGuard<'_, Adjacency> {
        self.adjacency
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn with_adjacency<T>(&self, f: impl FnOnce(&Adjacency) -> T) -> T {
        f(&self.read_adjacency())
    }
}
