// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Command implementations and their exit-code contract.
//!
//! | code | meaning |
//! |------|---------|
//! | 0    | success |
//! | 1    | build failure |
//! | 2    | configuration error (labels, manifest, cycles) |
//! | 3    | test failure |

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command as OsCommand;

use builder_cache::ActionCache;
use builder_cas::digest_of;
use builder_graph::{DepGraph, GraphError, Validation};
use builder_model::{BuildConfig, CommandHandler, TargetId, TargetKind, Workspace};
use builder_sandbox::HermeticExecutor;
use builder_sched::{BuildReport, BuildSession};
use tracing::warn;

use crate::manifest::load_workspace;

/// Successful run.
pub const EXIT_OK: u8 = 0;
/// At least one action failed.
pub const EXIT_BUILD_FAILURE: u8 = 1;
/// The workspace or invocation is misconfigured.
pub const EXIT_CONFIG: u8 = 2;
/// Builds succeeded but a test executable failed.
pub const EXIT_TEST_FAILURE: u8 = 3;

/// Per-invocation option overrides on top of the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// `-j/--jobs` override.
    pub jobs: Option<usize>,
    /// `--keep-going`.
    pub keep_going: bool,
    /// `--strict-determinism`.
    pub strict_determinism: bool,
}

/// `builder build <targets…>`.
pub fn build(root: &Path, targets: &[String], options: BuildOptions) -> u8 {
    match prepare(root, targets, options) {
        Ok((workspace, graph, config)) => run_build(root, &workspace, &graph, &config).0,
        Err(code) => code,
    }
}

/// `builder test <targets…>` — build, then run test executables.
pub fn test(root: &Path, targets: &[String], options: BuildOptions) -> u8 {
    let (workspace, graph, config) = match prepare(root, targets, options) {
        Ok(prepared) => prepared,
        Err(code) => return code,
    };
    let (code, _report) = run_build(root, &workspace, &graph, &config);
    if code != EXIT_OK {
        return code;
    }

    let mut failed = false;
    for target in workspace.targets() {
        if target.kind != TargetKind::Test {
            continue;
        }
        let Some(binary) = target.outs.first() else {
            eprintln!("test {} declares no output to run", target.id);
            failed = true;
            continue;
        };
        let direct = OsCommand::new(root.join(binary)).current_dir(root).status();
        // Cache materialization does not carry the executable bit; scripts
        // rematerialized from CAS still run through the shell.
        let status = match direct {
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                OsCommand::new("/bin/sh")
                    .arg(root.join(binary))
                    .current_dir(root)
                    .status()
            }
            other => other,
        };
        match status {
            Ok(status) if status.success() => {
                println!("PASS {}", target.id);
            }
            Ok(status) => {
                eprintln!("FAIL {} (exit {})", target.id, status.code().unwrap_or(-1));
                failed = true;
            }
            Err(err) => {
                eprintln!("FAIL {} ({err})", target.id);
                failed = true;
            }
        }
    }
    if failed {
        EXIT_TEST_FAILURE
    } else {
        EXIT_OK
    }
}

/// `builder query <expr…>` — `order`, `deps <label>`, `rdeps <label>`.
pub fn query(root: &Path, expr: &[String]) -> u8 {
    let workspace = match load_workspace(root) {
        Ok(workspace) => workspace,
        Err(err) => {
            eprintln!("error: {err:#}");
            return EXIT_CONFIG;
        }
    };
    let mut graph = DepGraph::new(Validation::Deferred);
    for target in workspace.targets() {
        if let Err(err) = graph.add_target(target) {
            eprintln!("error: {err}");
            return EXIT_CONFIG;
        }
    }
    let order = match graph.resolve() {
        Ok(order) => order,
        Err(err) => {
            report_graph_error(&err, &workspace);
            return EXIT_CONFIG;
        }
    };

    match expr {
        [op] if op == "order" => {
            for node in order.iter() {
                println!("{}", graph.node_id(node));
            }
            EXIT_OK
        }
        [op, label] if op == "deps" || op == "rdeps" => {
            let Some(node) = parse_known(&workspace, &graph, label) else {
                return EXIT_CONFIG;
            };
            let neighbors = if op == "deps" {
                graph.deps_of(node)
            } else {
                graph.rdeps_of(node)
            };
            for neighbor in neighbors {
                println!("{}", graph.node_id(neighbor));
            }
            EXIT_OK
        }
        _ => {
            eprintln!("error: unknown query {expr:?} (try: order | deps <label> | rdeps <label>)");
            EXIT_CONFIG
        }
    }
}

/// `builder clean [--cache]`.
pub fn clean(root: &Path, cache: bool) -> u8 {
    let workspace = match load_workspace(root) {
        Ok(workspace) => workspace,
        Err(err) => {
            eprintln!("error: {err:#}");
            return EXIT_CONFIG;
        }
    };
    for target in workspace.targets() {
        for out in &target.outs {
            match std::fs::remove_file(root.join(out)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(output = %out.display(), error = %err, "output not removed"),
            }
        }
    }
    if cache {
        let config = match BuildConfig::from_env(root) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {err}");
                return EXIT_CONFIG;
            }
        };
        match ActionCache::open(&config.cache_dir) {
            // Records first, then CAS — the invalidation pairing that keeps
            // the two stores consistent.
            Ok(cache) => {
                if let Err(err) = cache.clear_all() {
                    warn!(error = %err, "cache not fully cleared");
                }
            }
            Err(err) => warn!(error = %err, "cache not opened for clearing"),
        }
    }
    EXIT_OK
}

type Prepared = (Workspace, DepGraph, BuildConfig);

/// Shared front half: env config, manifest, target selection, graph.
fn prepare(root: &Path, targets: &[String], options: BuildOptions) -> Result<Prepared, u8> {
    let mut config = match BuildConfig::from_env(root) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return Err(EXIT_CONFIG);
        }
    };
    if let Some(jobs) = options.jobs {
        config.jobs = jobs.max(1);
    }
    config.keep_going |= options.keep_going;
    config.strict_determinism |= options.strict_determinism;

    let workspace = match load_workspace(root) {
        Ok(workspace) => workspace,
        Err(err) => {
            eprintln!("error: {err:#}");
            return Err(EXIT_CONFIG);
        }
    };

    // Selection: the transitive closure of the requested labels (everything
    // when no labels are given).
    let selected = if targets.is_empty() {
        workspace.targets().map(|t| t.id.clone()).collect()
    } else {
        match closure(&workspace, targets) {
            Ok(selected) => selected,
            Err(code) => return Err(code),
        }
    };

    let mut graph = DepGraph::new(Validation::Deferred);
    for target in workspace.targets().filter(|t| selected.contains(&t.id)) {
        if let Err(err) = graph.add_target(target) {
            eprintln!("error: {err}");
            return Err(EXIT_CONFIG);
        }
    }
    if let Err(err) = graph.resolve() {
        report_graph_error(&err, &workspace);
        return Err(EXIT_CONFIG);
    }
    Ok((workspace, graph, config))
}

fn run_build(
    root: &Path,
    workspace: &Workspace,
    graph: &DepGraph,
    config: &BuildConfig,
) -> (u8, Option<BuildReport>) {
    let cache = match ActionCache::open(&config.cache_dir) {
        Ok(cache) => cache,
        Err(err) => {
            // Cache trouble never fails a build: degrade to a scratch cache.
            warn!(error = %err, "cache unavailable, using scratch cache for this run");
            eprintln!("hint: `builder clean --cache` resets a damaged cache");
            let scratch = std::env::temp_dir().join(format!("builder-scratch-{}", std::process::id()));
            match ActionCache::open(&scratch) {
                Ok(cache) => cache,
                Err(err) => {
                    eprintln!("error: no usable cache location: {err}");
                    return (EXIT_CONFIG, None);
                }
            }
        }
    };
    let executor = HermeticExecutor::new(root, config.grace);
    let handler = CommandHandler;
    let session = BuildSession::new(graph, workspace, &cache, &executor, &handler, config);
    let report = session.run();

    for failure in &report.failures {
        let stderr_digest = digest_of(&failure.stderr);
        eprintln!("FAILED {}: {}", failure.target, failure.error);
        if !failure.stderr.is_empty() {
            eprintln!("  stderr ({} bytes, blake3 {})", failure.stderr.len(), stderr_digest);
            eprintln!("{}", String::from_utf8_lossy(&failure.stderr));
        }
    }
    println!(
        "{} executed, {} cache hits, {} failed, {} ms",
        report.metrics.executed,
        report.metrics.cache_hits,
        report.failures.len(),
        report.metrics.wall_ms
    );

    if report.success() {
        (EXIT_OK, Some(report))
    } else {
        (EXIT_BUILD_FAILURE, Some(report))
    }
}

/// Transitive dependency closure of the requested labels.
fn closure(workspace: &Workspace, labels: &[String]) -> Result<BTreeSet<TargetId>, u8> {
    let mut selected = BTreeSet::new();
    let mut stack = Vec::new();
    for label in labels {
        let id = match TargetId::parse(label) {
            Ok(id) => id,
            Err(err) => {
                eprintln!("error: {err}");
                return Err(EXIT_CONFIG);
            }
        };
        if workspace.target(&id).is_none() {
            eprintln!("error: unknown target {id}");
            suggest(workspace, label);
            return Err(EXIT_CONFIG);
        }
        stack.push(id);
    }
    while let Some(id) = stack.pop() {
        if !selected.insert(id.clone()) {
            continue;
        }
        if let Some(target) = workspace.target(&id) {
            for dep in &target.deps {
                stack.push(dep.clone());
            }
        }
    }
    Ok(selected)
}

fn parse_known(
    workspace: &Workspace,
    graph: &DepGraph,
    label: &str,
) -> Option<builder_graph::NodeRef> {
    let id = match TargetId::parse(label) {
        Ok(id) => id,
        Err(err) => {
            eprintln!("error: {err}");
            return None;
        }
    };
    match graph.find(&id) {
        Some(node) => Some(node),
        None => {
            eprintln!("error: unknown target {id}");
            suggest(workspace, label);
            None
        }
    }
}

fn suggest(workspace: &Workspace, label: &str) {
    let suggestions = workspace.suggest(label);
    if !suggestions.is_empty() {
        eprintln!("  did you mean: {}", suggestions.join(", "));
    }
}

fn report_graph_error(err: &GraphError, workspace: &Workspace) {
    eprintln!("error: {err}");
    match err {
        GraphError::CycleDetected { .. } => {
            eprintln!("  hint: `builder query order` prints the dependency order up to the cycle");
        }
        GraphError::UnknownDependency { dep, .. } => {
            suggest(workspace, &dep.to_string());
        }
        _ => {}
    }
}
