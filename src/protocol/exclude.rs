//! Exclusion rule compiler.
//!
//! A rule list is compiled into two predicates from the same ordered rules:
//! one anchored at the absolute source root (used while scanning) and one
//! anchored at `.` (used against paths relative to a target directory). For
//! any file `f` under `root`, `absolute.matches(f)` equals
//! `relative.matches(./relative_key(f))`.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use super::error::CapsuleError;
use super::path_utils;

/// Version-control directory, pruned at the root unless VCS data is included.
pub const VCS_DIR: &str = ".git";

/// Version-control metadata files, excluded by name unless VCS data is included.
pub const VCS_METADATA: &[&str] = &[".gitignore", ".gitattributes", ".gitmodules"];

/// Patterns excluded from every capsule.
pub const DEFAULT_EXCLUDES: &[&str] = &[".DS_Store"];

/// A single exclusion rule, serialized into the artifact header as tagged data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionRule {
    /// Matches any file or directory with this basename at any depth.
    Name(String),
    /// Matches a path anchored at the root; matching directories are not descended.
    PathPrune(String),
}

impl ExclusionRule {
    /// Classify a raw pattern. Returns `None` for patterns that normalize to nothing.
    ///
    /// The separator test runs on the raw text, so `./build` and `/build` stay
    /// anchored at the root.
    pub fn from_pattern(raw: &str) -> Option<Self> {
        let anchored = raw.trim().contains('/');
        let pattern = path_utils::normalize_key(raw);
        if pattern.is_empty() {
            return None;
        }
        if anchored || pattern == VCS_DIR {
            Some(Self::PathPrune(pattern))
        } else {
            Some(Self::Name(pattern))
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            Self::Name(p) | Self::PathPrune(p) => p,
        }
    }

    pub fn is_prune(&self) -> bool {
        matches!(self, Self::PathPrune(_))
    }
}

/// Ordered, de-duplicated list of exclusion rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionRules {
    rules: Vec<ExclusionRule>,
}

impl ExclusionRules {
    /// Create an empty rule list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default rules, with VCS data excluded unless `include_vcs` is set.
    pub fn with_defaults(include_vcs: bool) -> Self {
        let mut rules = Self::new();
        if !include_vcs {
            rules.push_pattern(VCS_DIR);
            for name in VCS_METADATA {
                rules.push_pattern(name);
            }
        }
        for pattern in DEFAULT_EXCLUDES {
            rules.push_pattern(pattern);
        }
        rules
    }

    /// Build from already-classified rules (e.g. read back from a header).
    pub fn from_rules(rules: Vec<ExclusionRule>) -> Self {
        let mut out = Self::new();
        for rule in rules {
            out.push(rule);
        }
        out
    }

    /// Classify and append a raw pattern.
    pub fn push_pattern(&mut self, raw: &str) {
        if let Some(rule) = ExclusionRule::from_pattern(raw) {
            self.push(rule);
        }
    }

    /// Append a rule unless an identical one is already present.
    pub fn push(&mut self, rule: ExclusionRule) {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
    }

    pub fn rules(&self) -> &[ExclusionRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Serialize for the artifact header.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.rules).unwrap_or_else(|_| "[]".to_string())
    }

    /// Deserialize directly into tagged rules.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let rules: Vec<ExclusionRule> = serde_json::from_str(text)?;
        Ok(Self::from_rules(rules))
    }

    /// Predicate over paths of the form `./a/b`, for target-directory traversal.
    pub fn relative_predicate(&self) -> Result<ExclusionPredicate, CapsuleError> {
        ExclusionPredicate::compile(&self.rules, PathBuf::from("."), ".")
    }

    /// Predicate over absolute paths below `root`, for source scanning.
    pub fn absolute_predicate(&self, root: &Path) -> Result<ExclusionPredicate, CapsuleError> {
        let root_str = root.to_str().ok_or_else(|| {
            CapsuleError::config(format!("source path is not valid UTF-8: {}", root.display()))
        })?;
        let prefix = escape_glob(root_str.trim_end_matches('/'));
        ExclusionPredicate::compile(&self.rules, root.to_path_buf(), &prefix)
    }
}

/// Compiled exclusion predicate bound to one anchor.
#[derive(Debug, Clone)]
pub struct ExclusionPredicate {
    anchor: PathBuf,
    names: GlobSet,
    prunes: GlobSet,
}

impl ExclusionPredicate {
    fn compile(
        rules: &[ExclusionRule],
        anchor: PathBuf,
        glob_prefix: &str,
    ) -> Result<Self, CapsuleError> {
        let mut names = GlobSetBuilder::new();
        let mut prunes = GlobSetBuilder::new();

        for rule in rules {
            match rule {
                ExclusionRule::Name(pattern) => {
                    names.add(build_glob(pattern)?);
                }
                ExclusionRule::PathPrune(pattern) => {
                    let anchored = format!("{}/{}", glob_prefix, pattern);
                    prunes.add(build_glob(&anchored)?);
                }
            }
        }

        let build_err = |e: globset::Error| CapsuleError::config(format!("cannot compile exclusion rules: {}", e));
        Ok(Self {
            anchor,
            names: names.build().map_err(build_err)?,
            prunes: prunes.build().map_err(build_err)?,
        })
    }

    pub fn anchor(&self) -> &Path {
        &self.anchor
    }

    /// Check a single path without looking at its ancestors.
    ///
    /// The walker calls this on every entry before descending, so ancestors
    /// have already been checked.
    pub fn matches_entry(&self, path: &Path) -> bool {
        if let Some(name) = path.file_name() {
            if self.names.is_match(name) {
                return true;
            }
        }
        self.prunes.is_match(path)
    }

    /// Check a path and every ancestor below the anchor.
    pub fn matches(&self, path: &Path) -> bool {
        let rel = match path.strip_prefix(&self.anchor) {
            Ok(rel) => rel,
            Err(_) => return false,
        };
        let mut current = self.anchor.clone();
        for component in rel.components() {
            if let Component::Normal(name) = component {
                current.push(name);
                if self.matches_entry(&current) {
                    return true;
                }
            }
        }
        false
    }

    /// Convenience for relative predicates: check a capsule key like `a/b.txt`.
    pub fn matches_key(&self, key: &str) -> bool {
        self.matches(&path_utils::key_to_path(&self.anchor, key))
    }
}

fn build_glob(pattern: &str) -> Result<globset::Glob, CapsuleError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .backslash_escape(false)
        .build()
        .map_err(|e| CapsuleError::config(format!("invalid exclusion pattern '{}': {}", pattern, e)))
}

/// Escape glob metacharacters so a literal path can prefix a pattern.
pub(crate) fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        match c {
            '*' | '?' | '[' | ']' | '{' | '}' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}
