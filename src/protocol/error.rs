// Centralized error handling for the capsule protocol
// Every variant carries enough context to print a suggestion for the operator

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Main error type for packing and replaying capsules
#[derive(Debug)]
pub enum CapsuleError {
    /// Bad or missing arguments, detected before any work begins
    Configuration { message: String },

    /// File system errors with context
    DirectoryNotFound { path: PathBuf },
    FileNotFound { path: PathBuf },
    PermissionDenied { path: PathBuf, operation: String },
    TargetNotEmpty { path: PathBuf },
    Io { path: Option<PathBuf>, operation: String, source: io::Error },

    /// Unreadable entry while walking a tree
    Scan { path: PathBuf, reason: String },

    /// Generation-time failure; aborts the whole build
    Encode { path: String, reason: String },
    /// Reconstruction-time failures; fatal to a single entry only
    Decode { path: String, reason: String },
    Write { path: String, reason: String },

    /// The artifact bytes do not follow the capsule layout
    ArtifactFormat { line: usize, reason: String },

    /// Stamped digest and recomputed digest disagree
    IntegrityMismatch { expected: String, computed: String },

    /// Operator answered "no" to a confirmation prompt
    UserDeclined { action: String },
    /// SIGINT/SIGTERM arrived while scratch resources were live
    Interrupted,
}

impl fmt::Display for CapsuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsuleError::Configuration { message } => {
                writeln!(f, "Invalid configuration: {}", message)?;
                write!(f, "Suggestion: Run with --help to see usage information")
            }
            CapsuleError::DirectoryNotFound { path } => {
                writeln!(f, "Directory not found: {}", path.display())?;
                write!(f, "Suggestion: Check that the directory path is correct and the directory exists")
            }
            CapsuleError::FileNotFound { path } => {
                writeln!(f, "File not found: {}", path.display())?;
                write!(f, "Suggestion: Check that the file path is correct and the file exists")
            }
            CapsuleError::PermissionDenied { path, operation } => {
                writeln!(f, "Permission denied while {}: {}", operation, path.display())?;
                write!(f, "Suggestion: Check file permissions or run with appropriate privileges")
            }
            CapsuleError::TargetNotEmpty { path } => {
                writeln!(f, "Target directory already exists and is not empty: {}", path.display())?;
                write!(f, "Suggestion: Use --update to overwrite, or choose another --target-dir")
            }
            CapsuleError::Io { path, operation, source } => {
                if let Some(p) = path {
                    writeln!(f, "I/O error while {} {}: {}", operation, p.display(), source)?;
                } else {
                    writeln!(f, "I/O error while {}: {}", operation, source)?;
                }
                write!(f, "Suggestion: Check file permissions and disk space")
            }
            CapsuleError::Scan { path, reason } => {
                writeln!(f, "Cannot scan {}: {}", path.display(), reason)?;
                write!(f, "Suggestion: Check that the file is readable")
            }
            CapsuleError::Encode { path, reason } => {
                writeln!(f, "Failed to encode {}: {}", path, reason)?;
                write!(f, "Suggestion: No artifact was written; fix the source entry and pack again")
            }
            CapsuleError::Decode { path, reason } => {
                writeln!(f, "Failed to decode {}: {}", path, reason)?;
                write!(f, "Suggestion: The artifact may be truncated or edited; regenerate it")
            }
            CapsuleError::Write { path, reason } => {
                writeln!(f, "Failed to write {}: {}", path, reason)?;
                write!(f, "Suggestion: Fix the target location and run again with --retry-failed")
            }
            CapsuleError::ArtifactFormat { line, reason } => {
                writeln!(f, "Malformed artifact at line {}: {}", line, reason)?;
                write!(f, "Suggestion: Check that the file is a capsule produced by 'capsule pack'")
            }
            CapsuleError::IntegrityMismatch { expected, computed } => {
                writeln!(f, "Integrity check failed")?;
                writeln!(f, "  Expected: {}", expected)?;
                writeln!(f, "  Computed: {}", computed)?;
                write!(f, "Suggestion: The tree drifted from the capsule; use --diff to inspect")
            }
            CapsuleError::UserDeclined { action } => {
                write!(f, "Cancelled: {} was declined", action)
            }
            CapsuleError::Interrupted => {
                write!(f, "Interrupted; scratch files were removed")
            }
        }
    }
}

impl std::error::Error for CapsuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CapsuleError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl CapsuleError {
    /// Create an I/O error with context about the operation and optional path
    pub fn from_io_error(err: io::Error, operation: &str, path: Option<PathBuf>) -> Self {
        match (err.kind(), path) {
            (io::ErrorKind::NotFound, Some(p)) => {
                if operation.contains("directory") {
                    CapsuleError::DirectoryNotFound { path: p }
                } else {
                    CapsuleError::FileNotFound { path: p }
                }
            }
            (io::ErrorKind::PermissionDenied, Some(p)) => CapsuleError::PermissionDenied {
                path: p,
                operation: operation.to_string(),
            },
            (_, path) => CapsuleError::Io {
                path,
                operation: operation.to_string(),
                source: err,
            },
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        CapsuleError::Configuration { message: message.into() }
    }
}
