// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Workspace manifest loading.
//!
//! The full build DSL is a separate collaborator; the CLI reads the
//! distilled `builder.json` it produces at the workspace root:
//!
//! ```json
//! {
//!   "targets": [
//!     {
//!       "id": "//x:lib",
//!       "kind": "library",
//!       "language": "c",
//!       "tool": "cc",
//!       "srcs": ["x/lib.c"],
//!       "deps": [],
//!       "flags": ["-O2"],
//!       "env": {"PATH": "/usr/bin:/bin"},
//!       "outs": ["x/lib.o"]
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use builder_model::{Target, TargetId, TargetKind, Workspace};
use serde::Deserialize;

/// Name of the manifest file at the workspace root.
pub const MANIFEST_NAME: &str = "builder.json";

#[derive(Debug, Deserialize)]
struct RawManifest {
    targets: Vec<RawTarget>,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    id: String,
    kind: String,
    #[serde(default)]
    language: String,
    #[serde(default)]
    tool: PathBuf,
    #[serde(default)]
    srcs: Vec<PathBuf>,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    outs: Vec<PathBuf>,
}

/// Load the workspace rooted at `root` from its manifest.
///
/// All errors here are configuration errors (CLI exit code 2): missing
/// manifest, malformed JSON, invalid labels, duplicate targets.
pub fn load_workspace(root: &Path) -> anyhow::Result<Workspace> {
    let path = root.join(MANIFEST_NAME);
    let bytes = std::fs::read(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let raw: RawManifest =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;

    let mut workspace = Workspace::new(root);
    for target in raw.targets {
        let id = TargetId::parse(&target.id)
            .with_context(|| format!("target {:?}", target.id))?;
        let kind = match target.kind.as_str() {
            "executable" => TargetKind::Executable,
            "library" => TargetKind::Library,
            "test" => TargetKind::Test,
            "custom" => TargetKind::Custom,
            other => bail!("target {id}: unknown kind {other:?}"),
        };
        let mut t = Target::new(id.clone(), kind, target.language);
        t.tool = target.tool;
        t.srcs = target.srcs;
        t.flags = target.flags;
        t.env = target.env;
        t.outs = target.outs;
        for dep in &target.deps {
            t.deps
                .push(TargetId::parse(dep).with_context(|| format!("target {id}, dep {dep:?}"))?);
        }
        if !workspace.add_target(t) {
            bail!("duplicate target {id}");
        }
    }
    Ok(workspace)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn minimal_manifest_parses() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_NAME),
            r#"{"targets":[{"id":"//x:lib","kind":"library","tool":"cc","outs":["x.o"]}]}"#,
        )
        .unwrap();
        let ws = load_workspace(dir.path()).unwrap();
        assert_eq!(ws.len(), 1);
        let id = TargetId::parse("//x:lib").unwrap();
        assert_eq!(ws.target(&id).unwrap().kind, TargetKind::Library);
    }

    #[test]
    fn bad_kind_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_NAME),
            r#"{"targets":[{"id":"//x:lib","kind":"sculpture"}]}"#,
        )
        .unwrap();
        assert!(load_workspace(dir.path()).is_err());
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_NAME),
            r#"{"targets":[
                {"id":"//x:lib","kind":"library"},
                {"id":"//x:lib","kind":"library"}
            ]}"#,
        )
        .unwrap();
        let err = load_workspace(dir.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
