// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Validated target labels of the form `//path/to/package:name`.

use std::fmt;

/// Errors produced while parsing a target label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    /// Label does not start with `//`.
    #[error("label {0:?} must start with //")]
    MissingRoot(String),

    /// Label has no `:name` part.
    #[error("label {0:?} must contain exactly one ':' separating package and name")]
    MissingName(String),

    /// Label contains a character outside the allowed set.
    #[error("label {label:?} contains illegal character {ch:?}")]
    IllegalCharacter {
        /// The offending label.
        label: String,
        /// The first illegal character encountered.
        ch: char,
    },

    /// Package path contains an empty, `.`, or `..` segment.
    #[error("label {0:?} has an empty or relative path segment")]
    BadSegment(String),
}

/// A validated target identity: `//path/to/package:name`.
///
/// Identity is unique within a workspace. Labels are immutable once parsed;
/// ordering and hashing operate on the canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId {
    package: String,
    name: String,
}

impl TargetId {
    /// Parse and validate a label.
    ///
    /// Allowed characters in both parts: ASCII alphanumerics, `_`, `-`, `.`,
    /// and `/` in the package path. The package path may be empty
    /// (`//:name` addresses the workspace root package).
    ///
    /// # Errors
    ///
    /// Returns a [`LabelError`] describing the first structural violation.
    pub fn parse(label: &str) -> Result<Self, LabelError> {
        let rest = label
            .strip_prefix("//")
            .ok_or_else(|| LabelError::MissingRoot(label.to_owned()))?;
        let (package, name) = rest
            .split_once(':')
            .ok_or_else(|| LabelError::MissingName(label.to_owned()))?;
        if name.is_empty() || name.contains(':') {
            return Err(LabelError::MissingName(label.to_owned()));
        }
        for part in [package, name] {
            if let Some(ch) = part
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')))
            {
                return Err(LabelError::IllegalCharacter {
                    label: label.to_owned(),
                    ch,
                });
            }
        }
        if name.contains('/') {
            return Err(LabelError::IllegalCharacter {
                label: label.to_owned(),
                ch: '/',
            });
        }
        if !package.is_empty()
            && package
                .split('/')
                .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(LabelError::BadSegment(label.to_owned()));
        }
        Ok(Self {
            package: package.to_owned(),
            name: name.to_owned(),
        })
    }

    /// The package path (the part between `//` and `:`).
    pub fn package(&self) -> &str {
        &self.package
    }

    /// The target name (the part after `:`).
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}", self.package, self.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_labels() {
        let id = TargetId::parse("//src/core:lib").unwrap();
        assert_eq!(id.package(), "src/core");
        assert_eq!(id.name(), "lib");
        assert_eq!(id.to_string(), "//src/core:lib");
    }

    #[test]
    fn root_package_is_legal() {
        let id = TargetId::parse("//:all").unwrap();
        assert_eq!(id.package(), "");
        assert_eq!(id.name(), "all");
    }

    #[test]
    fn rejects_missing_root() {
        assert!(matches!(
            TargetId::parse("src:lib"),
            Err(LabelError::MissingRoot(_))
        ));
    }

    #[test]
    fn rejects_missing_or_doubled_name() {
        assert!(matches!(
            TargetId::parse("//src/core"),
            Err(LabelError::MissingName(_))
        ));
        assert!(matches!(
            TargetId::parse("//src:a:b"),
            Err(LabelError::MissingName(_))
        ));
    }

    #[test]
    fn rejects_illegal_characters_and_segments() {
        assert!(matches!(
            TargetId::parse("//src core:lib"),
            Err(LabelError::IllegalCharacter { ch: ' ', .. })
        ));
        assert!(matches!(
            TargetId::parse("//src/../core:lib"),
            Err(LabelError::BadSegment(_))
        ));
        assert!(matches!(
            TargetId::parse("//src//core:lib"),
            Err(LabelError::BadSegment(_))
        ));
    }

    #[test]
    fn ordering_is_package_major() {
        let a = TargetId::parse("//a:x").unwrap();
        let b = TargetId::parse("//b:x").unwrap();
        assert!(a < b);
    }
}
