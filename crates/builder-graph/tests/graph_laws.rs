// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Structural laws of the dependency graph: topological ordering, cycle
//! reporting, and the validation modes.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use builder_graph::{DepGraph, GraphError, Validation};
use builder_model::{Target, TargetId, TargetKind};
use proptest::prelude::*;

fn target(label: &str, deps: &[&str]) -> Target {
    let mut t = Target::new(TargetId::parse(label).unwrap(), TargetKind::Library, "c");
    t.deps = deps.iter().map(|d| TargetId::parse(d).unwrap()).collect();
    t
}

#[test]
fn empty_graph_resolves_to_empty_order() {
    let mut graph = DepGraph::new(Validation::Deferred);
    let order = graph.resolve().unwrap();
    assert!(order.is_empty());
}

#[test]
fn duplicate_target_is_rejected() {
    let mut graph = DepGraph::new(Validation::Deferred);
    graph.add_target(&target("//x:lib", &[])).unwrap();
    assert!(matches!(
        graph.add_target(&target("//x:lib", &[])),
        Err(GraphError::DuplicateTarget(_))
    ));
}

#[test]
fn deferred_mode_allows_forward_references() {
    let mut graph = DepGraph::new(Validation::Deferred);
    graph.add_target(&target("//a:a", &["//b:b"])).unwrap();
    graph.add_target(&target("//b:b", &[])).unwrap();
    let order = graph.resolve().unwrap();
    let pos = |label: &str| {
        let id = TargetId::parse(label).unwrap();
        let node = graph.find(&id).unwrap();
        order.iter().position(|n| n == node).unwrap()
    };
    assert!(pos("//b:b") < pos("//a:a"), "dependency must come first");
}

#[test]
fn immediate_mode_requires_known_deps() {
    let mut graph = DepGraph::new(Validation::Immediate);
    assert!(matches!(
        graph.add_target(&target("//a:a", &["//b:b"])),
        Err(GraphError::UnknownDependency { .. })
    ));
}

#[test]
fn unknown_dep_is_reported_at_resolve_in_deferred_mode() {
    let mut graph = DepGraph::new(Validation::Deferred);
    graph.add_target(&target("//a:a", &["//ghost:dep"])).unwrap();
    match graph.resolve() {
        Err(GraphError::UnknownDependency { target, dep }) => {
            assert_eq!(target.to_string(), "//a:a");
            assert_eq!(dep.to_string(), "//ghost:dep");
        }
        other => panic!("expected UnknownDependency, got {other:?}"),
    }
}

#[test]
fn three_cycle_is_reported_in_order() {
    let mut graph = DepGraph::new(Validation::Deferred);
    graph.add_target(&target("//g:a", &["//g:b"])).unwrap();
    graph.add_target(&target("//g:b", &["//g:c"])).unwrap();
    graph.add_target(&target("//g:c", &["//g:a"])).unwrap();
    match graph.resolve() {
        Err(GraphError::CycleDetected { nodes }) => {
            let labels: Vec<String> = nodes.iter().map(ToString::to_string).collect();
            assert_eq!(labels, vec!["//g:a", "//g:b", "//g:c", "//g:a"]);
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}

#[test]
fn self_loop_reports_exactly_that_node() {
    let mut graph = DepGraph::new(Validation::Deferred);
    graph.add_target(&target("//g:a", &["//g:a"])).unwrap();
    match graph.resolve() {
        Err(GraphError::CycleDetected { nodes }) => {
            let labels: Vec<String> = nodes.iter().map(ToString::to_string).collect();
            assert_eq!(labels, vec!["//g:a", "//g:a"]);
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}

#[test]
fn immediate_mode_rejects_cycle_closing_edge() {
    let mut graph = DepGraph::new(Validation::Immediate);
    let a = graph.add_target(&target("//g:a", &[])).unwrap();
    let b = graph.add_target(&target("//g:b", &["//g:a"])).unwrap();
    // b already depends on a; making a depend on b closes the loop.
    match graph.add_edge(b, a) {
        Err(GraphError::CycleDetected { nodes }) => {
            assert_eq!(nodes.first(), nodes.last());
            assert!(nodes.len() >= 3);
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}

#[test]
fn depth_is_longest_path_from_leaves() {
    let mut graph = DepGraph::new(Validation::Deferred);
    // d depends on c depends on b depends on a; e depends on a only.
    graph.add_target(&target("//g:a", &[])).unwrap();
    graph.add_target(&target("//g:b", &["//g:a"])).unwrap();
    graph.add_target(&target("//g:c", &["//g:b"])).unwrap();
    graph
        .add_target(&target("//g:d", &["//g:c", "//g:a"]))
        .unwrap();
    graph.add_target(&target("//g:e", &["//g:a"])).unwrap();
    graph.resolve().unwrap();

    let node = |label: &str| graph.find(&TargetId::parse(label).unwrap()).unwrap();
    assert_eq!(graph.depth(node("//g:a")), 0);
    assert_eq!(graph.depth(node("//g:b")), 1);
    assert_eq!(graph.depth(node("//g:c")), 2);
    assert_eq!(graph.depth(node("//g:d")), 3, "longest path wins");
    assert_eq!(graph.depth(node("//g:e")), 1);
}

proptest! {
    /// Invariant 1: for all acyclic graphs, resolve() yields an order where
    /// every edge u → v places u before v.
    ///
    /// Acyclic-by-construction: node i may only depend on nodes j < i.
    #[test]
    fn topo_order_respects_every_edge(
        n in 1usize..24,
        edges in prop::collection::vec((0usize..24, 0usize..24), 0..64),
    ) {
        let mut graph = DepGraph::new(Validation::Deferred);
        let edges: Vec<(usize, usize)> = edges
            .into_iter()
            .filter(|&(dep, parent)| dep < parent && parent < n)
            .collect();
        for i in 0..n {
            let deps: Vec<String> = edges
                .iter()
                .filter(|&&(_, parent)| parent == i)
                .map(|&(dep, _)| format!("//gen:n{dep}"))
                .collect();
            let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
            graph.add_target(&target(&format!("//gen:n{i}"), &dep_refs)).unwrap();
        }
        let order = graph.resolve().unwrap();
        prop_assert_eq!(order.len(), n);
        let position: Vec<usize> = {
            let mut pos = vec![0usize; n];
            for (rank, node) in order.iter().enumerate() {
                pos[node.index()] = rank;
            }
            pos
        };
        for (dep, parent) in edges {
            prop_assert!(
                position[dep] < position[parent],
                "edge {} -> {} out of order", dep, parent
            );
        }
    }
}
