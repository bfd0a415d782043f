// Artifact assembly module
// Scan, stamp, encode and write one capsule artifact

use super::artifact::{Artifact, ArtifactHeader, FileRecord};
use super::classify::{Classification, Classifier};
use super::codec::{self, CodecOptions};
use super::digest::{self, TreeDigest};
use super::engine;
use super::error::CapsuleError;
use super::exclude::{self, ExclusionRule, ExclusionRules};
use super::path_utils;
use super::scan::{self, SkippedPath};
use crate::config::CapsuleConfig;
use chrono::Utc;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File holding the default version when none is given
pub const VERSION_FILE: &str = "VERSION";
pub const DEFAULT_VERSION: &str = "0.0.0";
pub const ARTIFACT_EXTENSION: &str = "capsule";

/// Options for one pack run; unset fields fall back to config or defaults
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    pub source: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub include_vcs: bool,
    pub exclude: Vec<String>,
    pub metadata: Vec<String>,
    pub force: bool,
    pub write_index: bool,
    pub show_progress: bool,
}

impl PackOptions {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self { source: source.into(), ..Self::default() }
    }
}

/// What a pack run produced
#[derive(Debug, Clone)]
pub struct PackSummary {
    pub artifact_path: PathBuf,
    pub index_path: Option<PathBuf>,
    pub file_count: usize,
    pub binary_count: usize,
    pub total_size: u64,
    pub digest: String,
    pub skipped: Vec<SkippedPath>,
}

impl PackSummary {
    pub fn display(&self) {
        println!("{} {}", "Created".green().bold(), self.artifact_path.display());
        println!("  Files:     {} ({} binary)", self.file_count, self.binary_count);
        println!("  Size:      {}", humansize::format_size(self.total_size, humansize::BINARY));
        println!("  SHA-256:   {}", self.digest);
        if let Some(index) = &self.index_path {
            println!("  Index:     {}", index.display());
        }
        if !self.skipped.is_empty() {
            println!("{}", format!("  Skipped {} unreadable paths:", self.skipped.len()).yellow());
            for skipped in &self.skipped {
                println!("    {} ({})", skipped.path.display(), skipped.reason);
            }
        }
    }
}

/// Builds artifacts from source trees
pub struct Assembler {
    config: CapsuleConfig,
    classifier: Classifier,
    codec: CodecOptions,
}

impl Assembler {
    pub fn new(config: &CapsuleConfig) -> Result<Self, CapsuleError> {
        Ok(Self {
            codec: config.codec_options()?,
            classifier: Classifier::new(config.classifier.clone()),
            config: config.clone(),
        })
    }

    /// Replace the classifier (e.g. to disable type sniffing)
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Build the exclusion rules for `source`, including self-exclusion of outputs
    pub fn exclusion_rules(&self, options: &PackOptions, source: &Path, outputs: &[PathBuf]) -> ExclusionRules {
        let mut rules = ExclusionRules::with_defaults(options.include_vcs || self.config.include_vcs);
        for pattern in self.config.exclude.iter().chain(options.exclude.iter()) {
            rules.push_pattern(pattern);
        }
        for output in outputs {
            if let Some(key) = path_utils::relative_key(output, source) {
                debug!("excluding own output {}", key);
                rules.push(ExclusionRule::PathPrune(exclude::escape_glob(&key)));
            }
        }
        rules
    }

    /// Pack `options.source` into an artifact on disk
    pub fn pack(&self, options: &PackOptions) -> Result<PackSummary, CapsuleError> {
        let source = options
            .source
            .canonicalize()
            .map_err(|e| CapsuleError::from_io_error(e, "open source directory", Some(options.source.clone())))?;
        if !source.is_dir() {
            return Err(CapsuleError::DirectoryNotFound { path: options.source.clone() });
        }

        let name = resolve_name(options.name.as_deref(), &source);
        let version = resolve_version(options.version.as_deref(), &source);

        let output_dir = match &options.output_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()
                .map_err(|e| CapsuleError::from_io_error(e, "resolve current directory", None))?,
        };
        fs::create_dir_all(&output_dir)
            .map_err(|e| CapsuleError::from_io_error(e, "create output directory", Some(output_dir.clone())))?;
        let output_dir = output_dir
            .canonicalize()
            .map_err(|e| CapsuleError::from_io_error(e, "open output directory", Some(output_dir.clone())))?;

        let artifact_path = output_dir.join(format!("{}-{}.{}", name, version, ARTIFACT_EXTENSION));
        if artifact_path.exists() && !options.force {
            return Err(CapsuleError::config(format!(
                "{} already exists; pass --force to replace it",
                artifact_path.display()
            )));
        }
        let index_path = index_path_for(&artifact_path);
        let outputs = [artifact_path.clone(), index_path.clone(), engine::failed_list_path(&artifact_path)];

        let rules = self.exclusion_rules(options, &source, &outputs);
        let (artifact, skipped) = self.build(&source, &name, &version, rules, options)?;

        let offsets = write_artifact(&artifact, &artifact_path)?;
        let index_path = if options.write_index || self.config.write_index {
            write_index(&index_path, &offsets)?;
            Some(index_path)
        } else {
            None
        };

        info!("wrote {} ({} files)", artifact_path.display(), artifact.records.len());
        Ok(PackSummary {
            artifact_path,
            index_path,
            file_count: artifact.records.len(),
            binary_count: artifact.records.iter().filter(|r| r.is_binary).count(),
            total_size: artifact.header.total_size,
            digest: artifact.header.source_hash.clone(),
            skipped,
        })
    }

    /// Scan, stamp and encode a tree into an in-memory artifact.
    ///
    /// Any encode failure aborts the whole build.
    fn build(
        &self,
        source: &Path,
        name: &str,
        version: &str,
        rules: ExclusionRules,
        options: &PackOptions,
    ) -> Result<(Artifact, Vec<SkippedPath>), CapsuleError> {
        let predicate = rules.absolute_predicate(source)?;
        let scan = scan::scan_source(source, &predicate, &self.classifier)?;
        let stamped: TreeDigest = digest::tree_digest(source, &rules)?;
        cross_check(&scan, &stamped)?;
        info!(
            "scanned {} files ({} binary, {} skipped), digest {}",
            scan.entries.len(),
            scan.binary_count(),
            scan.skipped.len(),
            stamped.hex
        );

        let progress = progress_bar(scan.entries.len() as u64, options.show_progress);
        let mut records = Vec::with_capacity(scan.entries.len());
        for entry in &scan.entries {
            progress.set_message(entry.relative_path.clone());
            let content = fs::read(&entry.absolute_path).map_err(|e| CapsuleError::Encode {
                path: entry.relative_path.clone(),
                reason: format!("cannot read source file: {}", e),
            })?;
            let class = if entry.is_binary { Classification::Binary } else { Classification::Text };
            let encoded = codec::encode(&entry.relative_path, &content, class, &self.codec)?;
            debug!("encoded {} as {}", entry.relative_path, encoded.encoding.tag());
            records.push(FileRecord::new(entry, encoded));
            progress.inc(1);
        }
        progress.finish_and_clear();

        let header = ArtifactHeader {
            name: name.to_string(),
            version: version.to_string(),
            created: Utc::now(),
            source_hash: stamped.hex,
            file_count: records.len(),
            total_size: scan.total_size(),
            exclusions: rules,
            metadata: options.metadata.clone(),
            generator: format!("capsule {}", env!("CARGO_PKG_VERSION")),
        };
        Ok((Artifact { header, records }, scan.skipped))
    }
}

/// `<artifact>.index.json`
pub fn index_path_for(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".index.json");
    artifact.with_file_name(name)
}

fn resolve_name(explicit: Option<&str>, source: &Path) -> String {
    let raw = explicit
        .map(str::to_string)
        .or_else(|| source.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .unwrap_or_default();
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "capsule".to_string()
    } else {
        cleaned
    }
}

fn resolve_version(explicit: Option<&str>, source: &Path) -> String {
    let from_file = || {
        fs::read_to_string(source.join(VERSION_FILE))
            .ok()
            .and_then(|text| text.lines().next().map(|l| l.trim().to_string()))
            .filter(|v| !v.is_empty())
    };
    let version = explicit
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(from_file)
        .unwrap_or_else(|| DEFAULT_VERSION.to_string());
    version.replace(['/', '\\', '\n', '\r'], "_")
}

fn cross_check(scan: &scan::SourceScan, stamped: &TreeDigest) -> Result<(), CapsuleError> {
    let scanned: BTreeSet<&str> = scan.entries.iter().map(|e| e.relative_path.as_str()).collect();
    let hashed: BTreeSet<&str> = stamped.files.iter().map(String::as_str).collect();
    if scanned == hashed {
        return Ok(());
    }
    let mut diverging: Vec<&str> = scanned.symmetric_difference(&hashed).copied().collect();
    diverging.truncate(10);
    Err(CapsuleError::Encode {
        path: diverging.first().map(|s| s.to_string()).unwrap_or_default(),
        reason: format!(
            "scan and hash passes disagree on the file set ({} vs {} files): {}",
            scanned.len(),
            hashed.len(),
            diverging.join(", ")
        ),
    })
}

fn progress_bar(len: u64, enabled: bool) -> ProgressBar {
    if !enabled || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files | {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

fn write_artifact(artifact: &Artifact, path: &Path) -> Result<std::collections::BTreeMap<String, u64>, CapsuleError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let write_err = |e: std::io::Error| CapsuleError::Write { path: path.display().to_string(), reason: e.to_string() };

    let temp = tempfile::Builder::new()
        .prefix(".capsule-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(write_err)?;
    let mut writer = BufWriter::new(temp.as_file());
    let offsets = artifact.write_to(&mut writer).map_err(write_err)?;
    writer.flush().map_err(write_err)?;
    drop(writer);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o755)).map_err(write_err)?;
    }

    temp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(offsets)
}

fn write_index(path: &Path, offsets: &std::collections::BTreeMap<String, u64>) -> Result<(), CapsuleError> {
    let json = serde_json::to_string_pretty(offsets)
        .map_err(|e| CapsuleError::Write { path: path.display().to_string(), reason: e.to_string() })?;
    fs::write(path, json).map_err(|e| CapsuleError::from_io_error(e, "write index", Some(path.to_path_buf())))
}
