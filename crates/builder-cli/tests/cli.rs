// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Exit-code contract of the `builder` binary, end to end over real
//! workspaces: 0 success, 1 build failure, 2 configuration error, 3 test
//! failure.
#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn builder_in(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("builder").unwrap();
    cmd.current_dir(dir.path());
    cmd.env("BUILDER_CACHE_DIR", dir.path().join(".cache"));
    cmd
}

fn write_manifest(dir: &TempDir, manifest: &str) {
    fs::write(dir.path().join("builder.json"), manifest).unwrap();
}

const HELLO_WS: &str = r#"{
  "targets": [
    {
      "id": "//x:lib",
      "kind": "library",
      "language": "sh",
      "tool": "/bin/sh",
      "flags": ["-c", "tr a-z A-Z < a.txt > out.txt"],
      "srcs": ["a.txt"],
      "env": {"PATH": "/usr/bin:/bin"},
      "outs": ["out.txt"]
    }
  ]
}"#;

// ── build: exit 0 and cache-hit second run ─────────────────────────────

#[test]
fn build_succeeds_then_hits_cache() {
    let dir = TempDir::new().unwrap();
    write_manifest(&dir, HELLO_WS);
    fs::write(dir.path().join("a.txt"), "hello").unwrap();

    builder_in(&dir)
        .args(["build", "//x:lib"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 executed"));
    assert_eq!(fs::read(dir.path().join("out.txt")).unwrap(), b"HELLO");

    builder_in(&dir)
        .args(["build", "//x:lib"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 executed"))
        .stdout(predicate::str::contains("1 cache hits"));
}

// ── build failure: exit 1 with stderr digest ───────────────────────────

#[test]
fn failing_action_exits_one() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        r#"{"targets":[{
            "id":"//x:boom","kind":"custom","tool":"/bin/sh",
            "flags":["-c","echo kaboom >&2; exit 9"],
            "env":{"PATH":"/usr/bin:/bin"},
            "outs":["never.txt"]
        }]}"#,
    );
    builder_in(&dir)
        .args(["build"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("FAILED //x:boom"))
        .stderr(predicate::str::contains("kaboom"));
}

// ── configuration errors: exit 2 ───────────────────────────────────────

#[test]
fn missing_manifest_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    builder_in(&dir).args(["build"]).assert().code(2);
}

#[test]
fn unknown_target_suggests_and_exits_two() {
    let dir = TempDir::new().unwrap();
    write_manifest(&dir, HELLO_WS);
    fs::write(dir.path().join("a.txt"), "hello").unwrap();
    builder_in(&dir)
        .args(["build", "//x:lob"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown target"))
        .stderr(predicate::str::contains("did you mean: //x:lib"));
}

#[test]
fn dependency_cycle_exits_two_before_any_action() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        r#"{"targets":[
            {"id":"//g:a","kind":"custom","tool":"/bin/sh","flags":["-c","echo a > a.txt"],"deps":["//g:b"],"outs":["a.txt"]},
            {"id":"//g:b","kind":"custom","tool":"/bin/sh","flags":["-c","echo b > b.txt"],"deps":["//g:c"],"outs":["b.txt"]},
            {"id":"//g:c","kind":"custom","tool":"/bin/sh","flags":["-c","echo c > c.txt"],"deps":["//g:a"],"outs":["c.txt"]}
        ]}"#,
    );
    builder_in(&dir)
        .args(["build"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("dependency cycle"))
        .stderr(predicate::str::contains("//g:a"));
    assert!(!dir.path().join("a.txt").exists(), "no action may run");
}

#[test]
fn bad_jobs_env_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    write_manifest(&dir, HELLO_WS);
    fs::write(dir.path().join("a.txt"), "hello").unwrap();
    builder_in(&dir)
        .args(["build"])
        .env("BUILDER_JOBS", "zero")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("BUILDER_JOBS"));
}

// ── query ──────────────────────────────────────────────────────────────

#[test]
fn query_order_lists_dependencies_first() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        r#"{"targets":[
            {"id":"//g:app","kind":"custom","tool":"/bin/sh","flags":["-c","true"],"deps":["//g:lib"],"outs":["app"]},
            {"id":"//g:lib","kind":"custom","tool":"/bin/sh","flags":["-c","true"],"outs":["lib"]}
        ]}"#,
    );
    let assert = builder_in(&dir).args(["query", "order"]).assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let lib_pos = stdout.find("//g:lib").unwrap();
    let app_pos = stdout.find("//g:app").unwrap();
    assert!(lib_pos < app_pos, "dependency prints before dependent");
}

#[test]
fn query_deps_prints_direct_dependencies() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        r#"{"targets":[
            {"id":"//g:app","kind":"custom","tool":"/bin/sh","flags":["-c","true"],"deps":["//g:lib"],"outs":["app"]},
            {"id":"//g:lib","kind":"custom","tool":"/bin/sh","flags":["-c","true"],"outs":["lib"]}
        ]}"#,
    );
    builder_in(&dir)
        .args(["query", "deps", "//g:app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("//g:lib"));
}

// ── test subcommand: exit 3 on failing test binaries ───────────────────

#[test]
fn failing_test_target_exits_three() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        r#"{"targets":[{
            "id":"//t:sad","kind":"test","tool":"/bin/sh",
            "flags":["-c","printf '#!/bin/sh\nexit 1\n' > sad.sh; chmod +x sad.sh"],
            "env":{"PATH":"/usr/bin:/bin"},
            "outs":["sad.sh"]
        }]}"#,
    );
    builder_in(&dir)
        .args(["test"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("FAIL //t:sad"));
}

#[test]
fn passing_test_target_exits_zero() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        &dir,
        r#"{"targets":[{
            "id":"//t:happy","kind":"test","tool":"/bin/sh",
            "flags":["-c","printf '#!/bin/sh\nexit 0\n' > happy.sh; chmod +x happy.sh"],
            "env":{"PATH":"/usr/bin:/bin"},
            "outs":["happy.sh"]
        }]}"#,
    );
    builder_in(&dir)
        .args(["test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PASS //t:happy"));
}

// ── clean ──────────────────────────────────────────────────────────────

#[test]
fn clean_removes_outputs_and_cache_flag_clears_cache() {
    let dir = TempDir::new().unwrap();
    write_manifest(&dir, HELLO_WS);
    fs::write(dir.path().join("a.txt"), "hello").unwrap();

    builder_in(&dir).args(["build"]).assert().success();
    assert!(dir.path().join("out.txt").exists());

    builder_in(&dir).args(["clean"]).assert().success();
    assert!(!dir.path().join("out.txt").exists());

    builder_in(&dir)
        .args(["clean", "--cache"])
        .assert()
        .success();
    // A post-clean build re-executes: the cache is really gone.
    builder_in(&dir)
        .args(["build"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 executed"));
}