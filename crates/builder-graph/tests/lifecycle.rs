// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Node state machine behavior under the execution-phase API: ready
//! claiming, completion propagation, skip cones, retry, and dynamic deps.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use builder_graph::{DepGraph, GraphError, NodeRef, NodeStatus, Validation};
use builder_model::{Target, TargetId, TargetKind};

fn target(label: &str, deps: &[&str]) -> Target {
    let mut t = Target::new(TargetId::parse(label).unwrap(), TargetKind::Library, "c");
    t.deps = deps.iter().map(|d| TargetId::parse(d).unwrap()).collect();
    t
}

/// Diamond: d depends on b and c; b and c depend on a.
fn diamond() -> (DepGraph, NodeRef, NodeRef, NodeRef, NodeRef) {
    let mut graph = DepGraph::new(Validation::Deferred);
    let a = graph.add_target(&target("//g:a", &[])).unwrap();
    let b = graph.add_target(&target("//g:b", &["//g:a"])).unwrap();
    let c = graph.add_target(&target("//g:c", &["//g:a"])).unwrap();
    let d = graph
        .add_target(&target("//g:d", &["//g:b", "//g:c"]))
        .unwrap();
    graph.resolve().unwrap();
    (graph, a, b, c, d)
}

#[test]
fn ready_frontier_claims_only_leaves() {
    let (graph, a, b, c, d) = diamond();
    let ready = graph.ready_frontier();
    assert_eq!(ready, vec![a]);
    assert_eq!(graph.status(a), NodeStatus::Ready);
    for node in [b, c, d] {
        assert_eq!(graph.status(node), NodeStatus::Pending);
    }
    // A second call must not hand the same node out again.
    assert!(graph.ready_frontier().is_empty());
}

#[test]
fn completion_wakes_dependents_exactly_at_zero() {
    let (graph, a, b, c, d) = diamond();
    graph.ready_frontier();
    assert!(graph.claim_running(a));
    let woken = graph.complete_success(a);
    assert_eq!(woken.len(), 2);
    assert!(woken.contains(&b) && woken.contains(&c));

    assert!(graph.claim_running(b));
    assert!(graph.complete_success(b).is_empty(), "d still waits on c");
    assert!(graph.claim_running(c));
    assert_eq!(graph.complete_success(c), vec![d], "last dep wakes d");
}

#[test]
fn claim_running_has_exactly_one_winner() {
    let (graph, a, ..) = diamond();
    graph.ready_frontier();
    let graph = std::sync::Arc::new(graph);
    let winners: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let graph = std::sync::Arc::clone(&graph);
                s.spawn(move || usize::from(graph.claim_running(a)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    assert_eq!(winners, 1, "exactly one thread may claim a ready node");
}

#[test]
fn skip_cone_marks_transitive_dependents() {
    let (graph, a, b, c, d) = diamond();
    graph.ready_frontier();
    graph.claim_running(a);
    assert!(graph.complete_failure(a));
    let skipped = graph.skip_cone(a);
    assert_eq!(skipped.len(), 3);
    for node in [b, c, d] {
        assert_eq!(graph.status(node), NodeStatus::Skipped);
    }
    // Skipped is terminal: the cone cannot be re-skipped or readied.
    assert!(graph.skip_cone(a).is_empty());
    assert!(graph.ready_frontier().is_empty());
}

#[test]
fn retry_is_the_only_exit_from_failed() {
    let (graph, a, ..) = diamond();
    graph.ready_frontier();
    graph.claim_running(a);
    graph.complete_failure(a);
    assert_eq!(graph.status(a), NodeStatus::Failed);

    assert_eq!(graph.retry(a), Some(1));
    assert_eq!(graph.status(a), NodeStatus::Ready);
    // Retry on a non-failed node is refused.
    assert_eq!(graph.retry(a), None);
    assert_eq!(graph.attempts(a), 1);
}

#[test]
fn dynamic_dep_attaches_and_balances_in_degree() {
    let mut graph = DepGraph::new(Validation::Deferred);
    let header = graph.add_target(&target("//inc:foo_h", &[])).unwrap();
    let main = graph.add_target(&target("//src:main", &[])).unwrap();
    graph.resolve().unwrap();
    graph.ready_frontier();
    graph.claim_running(main);

    // main discovers it reads the header while running.
    graph.attach_dynamic_deps(main, &[header]).unwrap();
    // Attaching twice is a dedupe no-op.
    graph.attach_dynamic_deps(main, &[header]).unwrap();
    assert_eq!(graph.deps_of(main), vec![header]);

    graph.claim_running(header);
    // Header completion decrements main's in-degree without readying it
    // (main is already Running).
    let woken = graph.complete_success(header);
    assert!(woken.is_empty());
    assert_eq!(graph.status(main), NodeStatus::Running);
}

#[test]
fn dynamic_dep_on_succeeded_node_is_rejected() {
    let mut graph = DepGraph::new(Validation::Deferred);
    let done = graph.add_target(&target("//g:done", &[])).unwrap();
    let main = graph.add_target(&target("//g:main", &[])).unwrap();
    graph.resolve().unwrap();
    graph.ready_frontier();
    graph.claim_running(done);
    graph.complete_success(done);
    graph.claim_running(main);

    assert!(matches!(
        graph.attach_dynamic_deps(main, &[done]),
        Err(GraphError::DynamicDepFinished { .. })
    ));
}

#[test]
fn dynamic_dep_cannot_close_a_cycle() {
    let mut graph = DepGraph::new(Validation::Deferred);
    let a = graph.add_target(&target("//g:a", &[])).unwrap();
    let b = graph.add_target(&target("//g:b", &["//g:a"])).unwrap();
    graph.resolve().unwrap();

    // b depends on a; a discovering b as an input would cycle.
    assert!(matches!(
        graph.attach_dynamic_deps(a, &[b]),
        Err(GraphError::CycleDetected { .. })
    ));
    // Rejection is all-or-nothing: no edge was kept.
    assert!(graph.deps_of(a).is_empty());
}

#[test]
fn attach_requires_resolved_graph() {
    let mut graph = DepGraph::new(Validation::Deferred);
    let a = graph.add_target(&target("//g:a", &[])).unwrap();
    let b = graph.add_target(&target("//g:b", &[])).unwrap();
    assert!(matches!(
        graph.attach_dynamic_deps(a, &[b]),
        Err(GraphError::NotResolved)
    ));
}
