// Directory comparison module
// Structural diff between a decoded capsule tree and a reference directory

use super::digest;
use super::error::CapsuleError;
use super::exclude::ExclusionRules;
use super::path_utils;
use super::scan::{self, WalkedFile};
use super::signal::InterruptGuard;
use colored::Colorize;
use globset::{Glob, GlobMatcher};
use std::collections::BTreeMap;
use std::path::Path;

/// A file whose content differs between the two trees
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChangedFile {
    pub path: String,
    pub capsule_sha256: String,
    pub reference_sha256: String,
}

/// A file whose permission bits differ
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModeChange {
    pub path: String,
    pub capsule_mode: String,
    pub reference_mode: String,
}

/// Report of a capsule-vs-reference comparison
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DiffReport {
    pub capsule_files: usize,
    pub reference_files: usize,
    pub unchanged: usize,
    pub changed: Vec<ChangedFile>,
    pub mode_changes: Vec<ModeChange>,
    pub only_in_capsule: Vec<String>,
    pub only_in_reference: Vec<String>,
}

impl DiffReport {
    pub fn is_clean(&self) -> bool {
        self.changed.is_empty()
            && self.mode_changes.is_empty()
            && self.only_in_capsule.is_empty()
            && self.only_in_reference.is_empty()
    }

    pub fn difference_count(&self) -> usize {
        self.changed.len() + self.mode_changes.len() + self.only_in_capsule.len() + self.only_in_reference.len()
    }

    /// Print the report to stdout
    pub fn display(&self) {
        println!("\n=== Capsule Diff Report ===\n");
        println!("Summary:");
        println!("  Capsule:     {} files", self.capsule_files);
        println!("  Reference:   {} files", self.reference_files);
        println!("  Unchanged:   {} files", self.unchanged);
        println!("  Changed:     {} files", self.changed.len());
        println!("  Permissions: {} files", self.mode_changes.len());
        println!("  Only in capsule:   {}", self.only_in_capsule.len());
        println!("  Only in reference: {}", self.only_in_reference.len());

        if !self.changed.is_empty() {
            println!("\nChanged Files:");
            for changed in &self.changed {
                println!("  {}", changed.path.yellow());
                println!("    capsule:   {}", changed.capsule_sha256);
                println!("    reference: {}", changed.reference_sha256);
            }
        }

        if !self.mode_changes.is_empty() {
            println!("\nPermission Changes:");
            for change in &self.mode_changes {
                println!("  {} {} -> {}", change.path.yellow(), change.capsule_mode, change.reference_mode);
            }
        }

        if !self.only_in_capsule.is_empty() {
            println!("\nOnly in capsule:");
            for path in &self.only_in_capsule {
                println!("  {} {}", "-".red(), path);
            }
        }

        if !self.only_in_reference.is_empty() {
            println!("\nOnly in reference:");
            for path in &self.only_in_reference {
                println!("  {} {}", "+".green(), path);
            }
        }

        println!();
        if self.is_clean() {
            println!("{}", "No differences found.".green());
        } else {
            println!("{}", format!("{} differences found.", self.difference_count()).red());
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Compile an optional glob over relative paths
pub fn path_filter(filter: Option<&str>) -> Result<Option<GlobMatcher>, CapsuleError> {
    filter
        .map(|pattern| {
            Glob::new(pattern)
                .map(|glob| glob.compile_matcher())
                .map_err(|e| CapsuleError::config(format!("invalid path filter '{}': {}", pattern, e)))
        })
        .transpose()
}

/// Compare two trees under the same exclusion rules
///
/// Only paths accepted by `filter` (when given) are considered on either side.
pub fn compare_trees(
    capsule_root: &Path,
    reference_root: &Path,
    rules: &ExclusionRules,
    filter: Option<&str>,
    interrupt: Option<&InterruptGuard>,
) -> Result<DiffReport, CapsuleError> {
    let predicate = rules.relative_predicate()?;
    let matcher = path_filter(filter)?;
    let keep = |file: &WalkedFile| matcher.as_ref().map_or(true, |m| m.is_match(&file.key));

    let capsule: BTreeMap<String, WalkedFile> = scan::walk_files(capsule_root, &predicate)?
        .files
        .into_iter()
        .filter(|f| keep(f))
        .map(|f| (f.key.clone(), f))
        .collect();
    let reference: BTreeMap<String, WalkedFile> = scan::walk_files(reference_root, &predicate)?
        .files
        .into_iter()
        .filter(|f| keep(f))
        .map(|f| (f.key.clone(), f))
        .collect();

    let mut report = DiffReport {
        capsule_files: capsule.len(),
        reference_files: reference.len(),
        ..DiffReport::default()
    };

    for (key, left) in &capsule {
        if let Some(guard) = interrupt {
            guard.check()?;
        }
        let Some(right) = reference.get(key) else {
            report.only_in_capsule.push(key.clone());
            continue;
        };

        let same_size = left.metadata.len() == right.metadata.len();
        let left_hash = digest::hash_file(&left.path)?;
        let right_hash = digest::hash_file(&right.path)?;
        if !same_size || left_hash != right_hash {
            report.changed.push(ChangedFile {
                path: key.clone(),
                capsule_sha256: left_hash,
                reference_sha256: right_hash,
            });
            continue;
        }

        let left_mode = scan::permission_bits(&left.metadata);
        let right_mode = scan::permission_bits(&right.metadata);
        if left_mode != right_mode {
            report.mode_changes.push(ModeChange {
                path: key.clone(),
                capsule_mode: path_utils::format_mode(left_mode),
                reference_mode: path_utils::format_mode(right_mode),
            });
            continue;
        }
        report.unchanged += 1;
    }

    report.only_in_reference = reference.keys().filter(|k| !capsule.contains_key(*k)).cloned().collect();
    Ok(report)
}
