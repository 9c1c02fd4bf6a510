// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Action key derivation.
//!
//! An [`ActionId`] is a 32-byte BLAKE3 digest over everything that can change
//! an action's outputs: tool identity, argv, the whitelisted environment
//! subset, the content digests of all inputs, and the declared output paths.
//! Every field is framed with a length prefix before hashing so that no
//! concatenation of adjacent fields can alias another action's encoding
//! (`["ab", "c"]` must not collide with `["a", "bc"]`).
//!
//! Canonicalization rules:
//! - argv tokens keep their order (order is semantically significant);
//! - env entries are sorted by key;
//! - inputs are sorted by path, then their digests are hashed in that order;
//! - declared outputs are sorted.
//!
//! The result is stable across machines for identical inputs — it is the
//! coordination point for distributed deduplication.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use builder_cas::Digest;

/// A 32-byte content hash identifying one action.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ActionId(pub Digest);

impl ActionId {
    /// View the id as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Render as lowercase hex.
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Parse from 64 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        Digest::from_hex(s).map(Self)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything that participates in the action key.
#[derive(Debug, Clone)]
pub struct ActionKeyInputs<'a> {
    /// Digest of the tool binary (or of its resolved identity string when the
    /// binary itself is not hashable, e.g. a system compiler pinned by
    /// version string).
    pub tool_digest: Digest,
    /// Argument vector, order-significant.
    pub argv: &'a [String],
    /// Whitelisted environment subset.
    pub env: &'a BTreeMap<String, String>,
    /// Input path → content digest pairs. Sorted by path before hashing.
    pub inputs: &'a [(PathBuf, Digest)],
    /// Declared output paths. Sorted before hashing.
    pub outputs: &'a [PathBuf],
}

/// Derive the [`ActionId`] for a fully specified action.
pub fn derive_action_id(key: &ActionKeyInputs<'_>) -> ActionId {
    let mut hasher = blake3::Hasher::new();

    frame(&mut hasher, b"tool");
    hasher.update(key.tool_digest.as_bytes());

    frame(&mut hasher, b"argv");
    count(&mut hasher, key.argv.len());
    for arg in key.argv {
        frame(&mut hasher, arg.as_bytes());
    }

    // BTreeMap iteration is already key-sorted.
    frame(&mut hasher, b"env");
    count(&mut hasher, key.env.len());
    for (name, value) in key.env {
        frame(&mut hasher, name.as_bytes());
        frame(&mut hasher, value.as_bytes());
    }

    frame(&mut hasher, b"inputs");
    let mut inputs: Vec<&(PathBuf, Digest)> = key.inputs.iter().collect();
    inputs.sort_by(|a, b| a.0.cmp(&b.0));
    count(&mut hasher, inputs.len());
    for (path, digest) in inputs {
        frame(&mut hasher, path_bytes(path).as_slice());
        hasher.update(digest.as_bytes());
    }

    frame(&mut hasher, b"outputs");
    let mut outputs: Vec<&PathBuf> = key.outputs.iter().collect();
    outputs.sort();
    count(&mut hasher, outputs.len());
    for path in outputs {
        frame(&mut hasher, path_bytes(path).as_slice());
    }

    ActionId(Digest(*hasher.finalize().as_bytes()))
}

/// Length-prefixed update: `u64 LE length ∥ bytes`.
fn frame(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn count(hasher: &mut blake3::Hasher, n: usize) {
    hasher.update(&(n as u64).to_le_bytes());
}

/// Paths hash as their UTF-8 form with `/` separators so the key is stable
/// across host path conventions.
fn path_bytes(path: &Path) -> Vec<u8> {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned().into_bytes()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/").into_bytes()
    }
}
