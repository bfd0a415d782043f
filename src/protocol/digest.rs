// Integrity hashing module
// One SHA-256 over the concatenated bytes of every included file, in byte
// order of relative path. Stamping and verification both go through
// `tree_digest` with the relative-form predicate.

use super::error::CapsuleError;
use super::exclude::ExclusionRules;
use super::scan::{self, SkippedPath};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Digest of a tree plus the files that went into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    pub hex: String,
    pub files: Vec<String>,
    pub total_bytes: u64,
    pub skipped: Vec<SkippedPath>,
}

impl TreeDigest {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn matches(&self, stamped: &str) -> bool {
        self.hex.eq_ignore_ascii_case(stamped.trim())
    }
}

/// Compute the tree digest of `root` under `rules`.
///
/// Files that cannot be opened are logged and left out; a read failure in the
/// middle of a file aborts, since the hasher state is then unrecoverable.
pub fn tree_digest(root: &Path, rules: &ExclusionRules) -> Result<TreeDigest, CapsuleError> {
    let predicate = rules.relative_predicate()?;
    let walk = scan::walk_files(root, &predicate)?;

    let mut hasher = Sha256::new();
    let mut files = Vec::with_capacity(walk.files.len());
    let mut skipped = walk.skipped;
    let mut total_bytes = 0u64;

    for file in walk.files {
        let handle = match File::open(&file.path) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("cannot read {} for hashing: {}", file.path.display(), e);
                skipped.push(SkippedPath { path: file.path, reason: e.to_string() });
                continue;
            }
        };
        let copied = io::copy(&mut BufReader::new(handle), &mut HashWriter(&mut hasher)).map_err(|e| {
            CapsuleError::Scan { path: file.path.clone(), reason: format!("read failed while hashing: {}", e) }
        })?;
        total_bytes += copied;
        files.push(file.key);
    }

    let hex = hex::encode(hasher.finalize());
    debug!("digest of {} over {} files ({} bytes): {}", root.display(), files.len(), total_bytes, hex);
    Ok(TreeDigest { hex, files, total_bytes, skipped })
}

/// Hex SHA-256 of a single file
pub fn hash_file(path: &Path) -> Result<String, CapsuleError> {
    let handle = File::open(path).map_err(|e| CapsuleError::from_io_error(e, "read file", Some(path.to_path_buf())))?;
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::new(handle), &mut HashWriter(&mut hasher))
        .map_err(|e| CapsuleError::from_io_error(e, "read file", Some(path.to_path_buf())))?;
    Ok(hex::encode(hasher.finalize()))
}

struct HashWriter<'a>(&'a mut Sha256);

impl Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
