//! Binary/text classification.
//!
//! Best-effort heuristic: opaque textual formats may be filed as binary and
//! the reverse. Misclassification never corrupts data, since both encodings
//! round-trip exactly; it only changes how the entry is embedded. All
//! thresholds live in [`ClassifierPolicy`].

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// How a file's bytes are embedded in the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Text,
    Binary,
}

impl Classification {
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
        }
    }
}

/// Tunable classification policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierPolicy {
    /// Number of leading bytes inspected for NUL and printable checks.
    pub sniff_window: usize,
    /// Look for the `file` utility and use it when present.
    pub use_file_command: bool,
    /// application/image/... subtypes that still carry text.
    pub text_mime_subtypes: Vec<String>,
    /// Keywords in a type description that indicate text.
    pub text_keywords: Vec<String>,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        let subtypes = [
            "json", "xml", "javascript", "x-javascript", "ecmascript", "yaml", "x-yaml", "toml", "csv",
            "x-sh", "x-shellscript", "markdown", "svg", "x-perl", "x-python",
            "x-ruby", "x-php", "sql", "x-tex", "rtf", "x-empty", "x-subrip",
        ];
        let keywords = [
            "text", "ascii", "utf-8", "unicode", "script", "source", "markup",
            "empty", "json", "xml", "html",
        ];
        Self {
            sniff_window: 1024,
            use_file_command: true,
            text_mime_subtypes: subtypes.iter().map(|s| s.to_string()).collect(),
            text_keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Output of a type-sniffing capability for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffReport {
    /// Full MIME report, e.g. `text/plain; charset=us-ascii`.
    pub mime: String,
    /// Human-readable description, e.g. `ASCII text`.
    pub description: String,
}

/// A capability that can report MIME information about a file.
pub trait TypeSniffer {
    fn sniff(&self, path: &Path) -> Option<SniffReport>;
}

/// Sniffer backed by the `file(1)` utility.
#[derive(Debug, Clone)]
pub struct FileCommandSniffer {
    program: String,
}

impl FileCommandSniffer {
    /// Check once for a working `file` binary.
    pub fn detect() -> Option<Self> {
        let program = "file".to_string();
        match Command::new(&program).arg("--version").output() {
            Ok(out) if out.status.success() => {
                debug!("type sniffing via {}", program);
                Some(Self { program })
            }
            _ => {
                debug!("no 'file' utility found; using printable-byte fallback");
                None
            }
        }
    }

    fn run(&self, args: &[&str], path: &Path) -> Option<String> {
        let out = Command::new(&self.program).args(args).arg(path).output().ok()?;
        if !out.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

impl TypeSniffer for FileCommandSniffer {
    fn sniff(&self, path: &Path) -> Option<SniffReport> {
        let mime = self.run(&["--brief", "--mime"], path)?;
        let description = self.run(&["--brief"], path).unwrap_or_default();
        Some(SniffReport { mime, description })
    }
}

/// Layered binary/text classifier.
pub struct Classifier {
    policy: ClassifierPolicy,
    sniffer: Option<Box<dyn TypeSniffer>>,
}

impl Classifier {
    /// Build from policy, probing for `file(1)` if the policy allows it.
    pub fn new(policy: ClassifierPolicy) -> Self {
        let sniffer: Option<Box<dyn TypeSniffer>> = if policy.use_file_command {
            FileCommandSniffer::detect().map(|s| Box::new(s) as Box<dyn TypeSniffer>)
        } else {
            None
        };
        Self { policy, sniffer }
    }

    /// Build with an explicit sniffer (or none, forcing the byte fallback).
    pub fn with_sniffer(policy: ClassifierPolicy, sniffer: Option<Box<dyn TypeSniffer>>) -> Self {
        Self { policy, sniffer }
    }

    /// Classify a file on disk. First matching layer wins.
    pub fn classify(&self, path: &Path) -> Classification {
        let window = match read_window(path, self.policy.sniff_window) {
            Ok(window) => window,
            Err(e) => {
                warn!("cannot read {} for classification ({}); treating as text", path.display(), e);
                return Classification::Text;
            }
        };

        if window.is_empty() {
            return Classification::Text;
        }
        if window.contains(&0) {
            return Classification::Binary;
        }

        match &self.sniffer {
            Some(sniffer) => match sniffer.sniff(path) {
                Some(report) => self.classify_report(&report),
                None => self.classify_window(&window),
            },
            None => self.classify_window(&window),
        }
    }

    /// MIME layer: decide from a sniffer report.
    pub fn classify_report(&self, report: &SniffReport) -> Classification {
        let full = report.mime.to_ascii_lowercase();
        let mime_type = full.split(';').next().unwrap_or("").trim();
        let (top, subtype) = mime_type.split_once('/').unwrap_or((mime_type, ""));

        if top == "text" {
            return if full.contains("charset=binary") {
                Classification::Binary
            } else {
                Classification::Text
            };
        }

        if matches!(top, "application" | "image" | "audio" | "video" | "font") {
            let texty = self.policy.text_mime_subtypes.iter().any(|s| subtype_matches(subtype, s));
            return if texty { Classification::Text } else { Classification::Binary };
        }

        let description = report.description.to_ascii_lowercase();
        let texty = self
            .policy
            .text_keywords
            .iter()
            .any(|k| description.contains(k.as_str()));
        if texty {
            Classification::Text
        } else {
            Classification::Binary
        }
    }

    /// Fallback layer: any non-printable byte outside common whitespace is binary.
    pub fn classify_window(&self, window: &[u8]) -> Classification {
        let binary = window
            .iter()
            .filter(|b| !matches!(b, b'\t' | b'\n' | b'\r' | 0x0b | 0x0c))
            .any(|b| !(0x20..=0x7e).contains(b));
        if binary {
            Classification::Binary
        } else {
            Classification::Text
        }
    }
}

/// `wanted` names the whole subtype, its base before `+`, or its `+suffix`
/// (`svg+xml` matches `svg` and `xml`).
fn subtype_matches(subtype: &str, wanted: &str) -> bool {
    match subtype.split_once('+') {
        Some((base, suffix)) => base == wanted || suffix == wanted,
        None => subtype == wanted,
    }
}

fn read_window(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut window = Vec::with_capacity(limit.min(64 * 1024));
    file.take(limit as u64).read_to_end(&mut window)?;
    Ok(window)
}
