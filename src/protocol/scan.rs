// Directory scanning module
// Sequential traversal shared by the scan pass (absolute predicate) and the
// digest walk (relative predicate)

use super::classify::Classifier;
use super::error::CapsuleError;
use super::exclude::ExclusionPredicate;
use super::path_utils;
use std::fs::{self, File, Metadata};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A regular file found by the walker
#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub key: String,
    pub path: PathBuf,
    pub metadata: Metadata,
}

/// A path the walker could not take into account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of one walk: included files sorted by key, plus skipped paths
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub files: Vec<WalkedFile>,
    pub skipped: Vec<SkippedPath>,
}

impl WalkOutcome {
    pub fn keys(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.key.as_str()).collect()
    }
}

/// Walk `root`, consulting `predicate` with paths rebuilt under its anchor.
///
/// An absolute predicate is anchored at `root` itself, a relative one at `.`,
/// so the same traversal serves both and excluded directories are never
/// descended. Symlinks and special files are ignored. Files are returned in
/// byte order of their relative key.
pub fn walk_files(root: &Path, predicate: &ExclusionPredicate) -> Result<WalkOutcome, CapsuleError> {
    let metadata = fs::metadata(root)
        .map_err(|e| CapsuleError::from_io_error(e, "read directory", Some(root.to_path_buf())))?;
    if !metadata.is_dir() {
        return Err(CapsuleError::DirectoryNotFound { path: root.to_path_buf() });
    }
    // The root itself must be listable; deeper failures only skip a subtree
    fs::read_dir(root)
        .map_err(|e| CapsuleError::from_io_error(e, "read directory", Some(root.to_path_buf())))?;

    let mut outcome = WalkOutcome::default();
    walk_recursive(root, root, predicate, &mut outcome);
    outcome.files.sort_by(|a, b| a.key.as_bytes().cmp(b.key.as_bytes()));
    Ok(outcome)
}

fn walk_recursive(root: &Path, dir: &Path, predicate: &ExclusionPredicate, outcome: &mut WalkOutcome) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read directory {}: {}", dir.display(), e);
            outcome.skipped.push(SkippedPath { path: dir.to_path_buf(), reason: e.to_string() });
            return;
        }
    };

    let mut children: Vec<_> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("cannot read directory entry in {}: {}", dir.display(), e);
                None
            }
        })
        .collect();
    children.sort_by_key(|entry| entry.file_name());

    for entry in children {
        let path = entry.path();

        let key = match path_utils::relative_key(&path, root) {
            Some(key) => key,
            None => {
                warn!("skipping {}: name cannot be stored in a capsule", path.display());
                outcome.skipped.push(SkippedPath {
                    path,
                    reason: "name is not UTF-8 or contains a line break".to_string(),
                });
                continue;
            }
        };

        if predicate.matches_entry(&path_utils::key_to_path(predicate.anchor(), &key)) {
            debug!("excluded {}", key);
            continue;
        }

        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                warn!("cannot read metadata for {}: {}", path.display(), e);
                outcome.skipped.push(SkippedPath { path, reason: e.to_string() });
                continue;
            }
        };

        if file_type.is_symlink() {
            debug!("skipping symlink {}", key);
        } else if file_type.is_dir() {
            walk_recursive(root, &path, predicate, outcome);
        } else if file_type.is_file() {
            match entry.metadata() {
                Ok(metadata) => outcome.files.push(WalkedFile { key, path, metadata }),
                Err(e) => {
                    warn!("cannot read metadata for {}: {}", path.display(), e);
                    outcome.skipped.push(SkippedPath { path, reason: e.to_string() });
                }
            }
        } else {
            debug!("skipping special file {}", key);
        }
    }
}

/// A file selected for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
    pub permission_bits: u32,
    pub is_binary: bool,
}

/// Immutable output of the scan pass
#[derive(Debug, Default)]
pub struct SourceScan {
    pub entries: Vec<SourceEntry>,
    pub skipped: Vec<SkippedPath>,
}

impl SourceScan {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn binary_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_binary).count()
    }
}

/// Scan a source tree with the absolute-form predicate and classify each file.
///
/// Unreadable files are logged and skipped (a scan error never aborts the pass).
pub fn scan_source(
    root: &Path,
    predicate: &ExclusionPredicate,
    classifier: &Classifier,
) -> Result<SourceScan, CapsuleError> {
    let walk = walk_files(root, predicate)?;
    let mut scan = SourceScan { entries: Vec::with_capacity(walk.files.len()), skipped: walk.skipped };

    for file in walk.files {
        if let Err(e) = File::open(&file.path) {
            let err = CapsuleError::Scan { path: file.path.clone(), reason: e.to_string() };
            warn!("{}", err);
            scan.skipped.push(SkippedPath { path: file.path, reason: e.to_string() });
            continue;
        }

        let class = classifier.classify(&file.path);
        debug!("{} ({} bytes, {})", file.key, file.metadata.len(), class.name());
        let is_binary = class.is_binary();
        scan.entries.push(SourceEntry {
            permission_bits: permission_bits(&file.metadata),
            size_bytes: file.metadata.len(),
            relative_path: file.key,
            absolute_path: file.path,
            is_binary,
        });
    }

    Ok(scan)
}

#[cfg(unix)]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
