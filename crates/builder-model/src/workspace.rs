// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The workspace: a root directory plus the set of declared targets.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::{did_you_mean, Target, TargetId};

/// One build invocation's view of the declared targets.
///
/// The workspace owns [`Target`]s; the dependency graph holds labels and looks
/// targets up here. Duplicate identities are rejected at insertion so every
/// later layer can assume labels are unique.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    targets: Vec<Target>,
    by_id: FxHashMap<TargetId, usize>,
}

impl Workspace {
    /// Create an empty workspace rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            targets: Vec::new(),
            by_id: FxHashMap::default(),
        }
    }

    /// The workspace root directory. Source and output paths are relative to
    /// this.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Insert a target. Returns `false` (and leaves the workspace unchanged)
    /// if a target with the same identity already exists.
    pub fn add_target(&mut self, target: Target) -> bool {
        if self.by_id.contains_key(&target.id) {
            return false;
        }
        self.by_id.insert(target.id.clone(), self.targets.len());
        self.targets.push(target);
        true
    }

    /// Look up a target by identity.
    pub fn target(&self, id: &TargetId) -> Option<&Target> {
        self.by_id.get(id).map(|&i| &self.targets[i])
    }

    /// Iterate targets in declaration order.
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    /// Number of declared targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns `true` if no targets are declared.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Closest known labels to `label`, for did-you-mean diagnostics.
    pub fn suggest(&self, label: &str) -> Vec<String> {
        let known: Vec<String> = self.targets.iter().map(|t| t.id.to_string()).collect();
        did_you_mean(label, known.iter().map(String::as_str))
    }
}
