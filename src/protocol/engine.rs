//! Reconstruction engine.
//!
//! Replays the records of an [`Artifact`] against a target directory under
//! one [`RunMode`]. Each entry moves through
//! `Pending -> Skipped`, `Pending -> Decoding -> Written -> PermissionsApplied`
//! or `Pending -> Decoding -> Failed`. A failed entry never stops the run; the
//! failures are collected in [`RunState`] and persisted next to the artifact
//! so `--retry-failed` can pick them up.

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::artifact::{self, Artifact, ArtifactHeader, FileRecord};
use super::codec;
use super::compare::{self, DiffReport};
use super::digest;
use super::error::CapsuleError;
use super::path_utils;
use super::signal::InterruptGuard;

/// What a run does with the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Write every entry into a new or empty target.
    Create,
    /// Write every entry, overwriting existing files.
    Update,
    /// Re-attempt only the entries on a failed list.
    RetryFailed { list: Option<PathBuf> },
    /// Decode everything, write nothing.
    DryRun,
    /// Compare the target's digest with the stamped one.
    Verify,
    /// Re-stamp the artifact with the target's digest after confirmation.
    RecalculateHash,
    /// List header and entries.
    Dump { filter: Option<String> },
    /// Decode into a scratch directory and compare with a reference tree.
    Diff { reference: PathBuf, filter: Option<String> },
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::RetryFailed { .. } => "retry-failed",
            Self::DryRun => "dry-run",
            Self::Verify => "verify",
            Self::RecalculateHash => "recalculate-hash",
            Self::Dump { .. } => "dump",
            Self::Diff { .. } => "diff",
        }
    }

    fn writes_target(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::RetryFailed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Skipped,
    Decoding,
    Written,
    PermissionsApplied,
    Failed,
}

impl EntryState {
    /// States that count towards a successful run.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Skipped | Self::Written | Self::PermissionsApplied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    pub path: String,
    pub state: EntryState,
    pub reason: Option<String>,
}

impl EntryOutcome {
    fn new(path: &str, state: EntryState) -> Self {
        Self { path: path.to_string(), state, reason: None }
    }

    fn failed(path: &str, err: &CapsuleError) -> Self {
        let reason = err.to_string().lines().next().unwrap_or_default().to_string();
        Self { path: path.to_string(), state: EntryState::Failed, reason: Some(reason) }
    }
}

/// Per-invocation bookkeeping.
#[derive(Debug, Clone)]
pub struct RunState {
    pub mode: RunMode,
    pub failed_entries: BTreeSet<String>,
    pub success_count: usize,
    pub expected_count: usize,
}

impl RunState {
    pub fn new(mode: RunMode, expected_count: usize) -> Self {
        Self { mode, failed_entries: BTreeSet::new(), success_count: 0, expected_count }
    }

    /// Start from a persisted failed list. The list is handed back and the
    /// state cleared, so only entries failing again end up recorded.
    pub fn seeded(mode: RunMode, previous: impl IntoIterator<Item = String>) -> (Self, BTreeSet<String>) {
        let mut state = Self::new(mode, 0);
        state.failed_entries.extend(previous);
        let retry = std::mem::take(&mut state.failed_entries);
        state.expected_count = retry.len();
        (state, retry)
    }

    pub fn record(&mut self, outcome: &EntryOutcome) {
        if outcome.state == EntryState::Failed {
            self.failed_entries.insert(outcome.path.clone());
        } else if outcome.state.is_success() {
            self.success_count += 1;
        }
    }
}

/// Asks the user before destructive steps.
pub trait Prompt {
    fn confirm(&mut self, question: &str) -> Result<bool, CapsuleError>;
}

/// Reads a yes/no answer from standard input.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm(&mut self, question: &str) -> Result<bool, CapsuleError> {
        eprint!("{} [y/N] ", question);
        io::stderr().flush().ok();
        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| CapsuleError::from_io_error(e, "read confirmation", None))?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

/// `<artifact>.failed.json`
pub fn failed_list_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".failed.json");
    artifact.with_file_name(name)
}

/// Persisted list of entries that failed in the last writing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedList {
    pub artifact: String,
    pub target: PathBuf,
    pub recorded: DateTime<Utc>,
    pub entries: Vec<String>,
}

impl FailedList {
    pub fn load(path: &Path) -> Result<Self, CapsuleError> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CapsuleError::config(format!(
                "no failed-entry list at {}; nothing to retry",
                path.display()
            )),
            _ => CapsuleError::from_io_error(e, "read failed list", Some(path.to_path_buf())),
        })?;
        serde_json::from_str(&text)
            .map_err(|e| CapsuleError::config(format!("malformed failed-entry list {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<(), CapsuleError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CapsuleError::Write { path: path.display().to_string(), reason: e.to_string() })?;
        fs::write(path, json).map_err(|e| CapsuleError::from_io_error(e, "write failed list", Some(path.to_path_buf())))
    }

    pub fn clear(path: &Path) -> Result<(), CapsuleError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::from_io_error(e, "remove failed list", Some(path.to_path_buf()))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Location of the artifact on disk; needed for the failed list and re-stamping.
    pub artifact_path: Option<PathBuf>,
    pub target_dir: Option<PathBuf>,
    pub mode: RunMode,
    /// Parent of the Diff scratch directory; the system temp dir when unset.
    pub scratch_root: Option<PathBuf>,
}

/// `./<name>` for an artifact header.
pub fn default_target_dir(header: &ArtifactHeader) -> PathBuf {
    PathBuf::from(header.default_target_name())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCheck {
    pub expected: String,
    pub computed: String,
    pub file_count: usize,
}

impl DigestCheck {
    pub fn matches(&self) -> bool {
        self.expected.eq_ignore_ascii_case(&self.computed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpEntry {
    pub path: String,
    pub mode: String,
    pub kind: &'static str,
    pub size: u64,
    pub encoding: String,
}

/// Result of one engine run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: RunMode,
    pub target: PathBuf,
    pub outcomes: Vec<EntryOutcome>,
    pub failed: Vec<String>,
    pub success_count: usize,
    pub expected_count: usize,
    pub failed_list: Option<PathBuf>,
    pub digest: Option<DigestCheck>,
    pub diff: Option<DiffReport>,
    /// Dry-run plan lines.
    pub listed: Vec<String>,
    pub dump: Vec<DumpEntry>,
    pub header: Option<ArtifactHeader>,
    pub cancelled: bool,
    pub stamped_rewritten: bool,
    /// Records the header declares but the artifact does not contain.
    pub missing_records: usize,
}

impl RunReport {
    fn new(mode: RunMode, target: PathBuf) -> Self {
        Self {
            mode,
            target,
            outcomes: Vec::new(),
            failed: Vec::new(),
            success_count: 0,
            expected_count: 0,
            failed_list: None,
            digest: None,
            diff: None,
            listed: Vec::new(),
            dump: Vec::new(),
            header: None,
            cancelled: false,
            stamped_rewritten: false,
            missing_records: 0,
        }
    }

    fn absorb(&mut self, state: RunState) {
        self.failed = state.failed_entries.into_iter().collect();
        self.success_count = state.success_count;
        self.expected_count = state.expected_count;
    }

    pub fn is_success(&self) -> bool {
        match &self.mode {
            RunMode::Verify => self.digest.as_ref().is_some_and(DigestCheck::matches),
            RunMode::RecalculateHash => !self.cancelled,
            RunMode::Dump { .. } => true,
            RunMode::Diff { .. } => {
                self.failed.is_empty()
                    && self.missing_records == 0
                    && self.diff.as_ref().is_some_and(DiffReport::is_clean)
            }
            _ => self.failed.is_empty() && self.missing_records == 0,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn display(&self) {
        match &self.mode {
            RunMode::Verify => self.display_verify(),
            RunMode::RecalculateHash => self.display_recalculate(),
            RunMode::Dump { .. } => self.display_dump(),
            RunMode::DryRun => {
                println!("Dry run into {} ({} entries):", self.target.display(), self.listed.len());
                for line in &self.listed {
                    println!("  {}", line);
                }
            }
            RunMode::Diff { .. } => {
                if let Some(diff) = &self.diff {
                    diff.display();
                }
            }
            _ => {
                let status = format!(
                    "{}: {}/{} entries restored into {}",
                    self.mode.name(),
                    self.success_count,
                    self.expected_count,
                    self.target.display()
                );
                if self.is_success() {
                    println!("{}", status.green());
                } else {
                    println!("{}", status.yellow());
                }
            }
        }
        self.display_failures();
    }

    fn display_verify(&self) {
        let Some(check) = &self.digest else { return };
        println!("\n================================================================");
        if check.matches() {
            println!("{}", "                       ALL GOOD                                 ".green().bold());
        } else {
            println!("{}", "                  INTEGRITY MISMATCH                            ".red().bold());
        }
        println!("================================================================\n");
        println!("  Target:   {}", self.target.display());
        println!("  Files:    {}", check.file_count);
        println!("  Expected: {}", check.expected);
        println!("  Computed: {}", check.computed);
        if !check.matches() {
            let err = CapsuleError::IntegrityMismatch { expected: check.expected.clone(), computed: check.computed.clone() };
            println!("\n{}", err.to_string().red());
        }
    }

    fn display_recalculate(&self) {
        let Some(check) = &self.digest else { return };
        println!("  Stamped:  {}", check.expected);
        println!("  Computed: {}", check.computed);
        if check.matches() {
            println!("{}", "Stamped hash already matches; nothing to do.".green());
        } else if self.stamped_rewritten {
            println!("{}", "Stamped hash updated.".green());
        } else if self.cancelled {
            let declined = CapsuleError::UserDeclined { action: "hash recalculation".to_string() };
            println!("{}", declined.to_string().yellow());
        }
    }

    fn display_dump(&self) {
        if let Some(header) = &self.header {
            println!("Name:        {}", header.name);
            println!("Version:     {}", header.version);
            println!("Created:     {}", header.created.to_rfc3339());
            println!("SHA-256:     {}", header.source_hash);
            println!("Files:       {}", header.file_count);
            println!("Total size:  {}", humansize::format_size(header.total_size, humansize::BINARY));
            println!("Generator:   {}", header.generator);
            for rule in header.exclusions.rules() {
                let kind = if rule.is_prune() { "prune" } else { "name" };
                println!("Exclude:     {} {}", kind, rule.pattern());
            }
            for line in &header.metadata {
                println!("Meta:        {}", line);
            }
            println!();
        }
        for entry in &self.dump {
            println!("#@@ BEGIN {}", entry.path);
            println!("    mode {}  {}  {} bytes  {}", entry.mode, entry.kind, entry.size, entry.encoding);
        }
        println!("\n{} entries listed", self.dump.len());
    }

    fn display_failures(&self) {
        if self.missing_records > 0 {
            println!(
                "{}",
                format!("Artifact is truncated: {} declared entries are missing", self.missing_records).red()
            );
        }
        if self.failed.is_empty() {
            return;
        }
        println!("{}", format!("\n{} entries failed:", self.failed.len()).red());
        for outcome in self.outcomes.iter().filter(|o| o.state == EntryState::Failed) {
            println!("  {} {}", outcome.path, outcome.reason.as_deref().unwrap_or_default().dimmed());
        }
        if let Some(list) = &self.failed_list {
            println!("Failed entries saved to {}; re-run with --retry-failed", list.display());
        }
    }
}

/// Replays one artifact against a target directory.
pub struct ReconstructionEngine<'a> {
    artifact: &'a Artifact,
    options: RunOptions,
    target: PathBuf,
}

impl<'a> ReconstructionEngine<'a> {
    pub fn new(artifact: &'a Artifact, options: RunOptions) -> Self {
        let target = options
            .target_dir
            .clone()
            .unwrap_or_else(|| default_target_dir(&artifact.header));
        Self { artifact, options, target }
    }

    /// Run with SIGINT/SIGTERM routed to an interrupt flag for the duration.
    pub fn run(&self, prompt: &mut dyn Prompt) -> Result<RunReport, CapsuleError> {
        let guard = InterruptGuard::install();
        self.run_guarded(prompt, &guard)
    }

    /// Run, stopping with [`CapsuleError::Interrupted`] once `guard` trips.
    /// Entries already written stay in place; scratch directories are removed.
    pub fn run_guarded(&self, prompt: &mut dyn Prompt, guard: &InterruptGuard) -> Result<RunReport, CapsuleError> {
        let mode = self.options.mode.clone();
        info!("{} run of '{}' against {}", mode.name(), self.artifact.header.name, self.target.display());
        let mut report = RunReport::new(mode.clone(), self.target.clone());

        match &mode {
            RunMode::Create | RunMode::Update => self.run_write(&mut report, guard)?,
            RunMode::RetryFailed { list } => self.run_retry(list.as_deref(), &mut report, guard)?,
            RunMode::DryRun => self.run_dry(&mut report)?,
            RunMode::Verify => {
                report.digest = Some(self.check_target()?);
            }
            RunMode::RecalculateHash => self.run_recalculate(prompt, &mut report)?,
            RunMode::Dump { filter } => self.run_dump(filter.as_deref(), &mut report)?,
            RunMode::Diff { reference, filter } => self.run_diff(reference, filter.as_deref(), &mut report, guard)?,
        }

        if mode.writes_target() {
            self.persist_failures(&mut report)?;
        }
        Ok(report)
    }

    fn run_write(&self, report: &mut RunReport, guard: &InterruptGuard) -> Result<(), CapsuleError> {
        let overwrite = self.options.mode == RunMode::Update;
        self.prepare_target(overwrite)?;

        let mut state = RunState::new(self.options.mode.clone(), self.expected_entries(report));
        for record in &self.artifact.records {
            guard.check()?;
            let outcome = apply_entry(&self.target, record, overwrite);
            state.record(&outcome);
            report.outcomes.push(outcome);
        }
        report.absorb(state);
        Ok(())
    }

    fn run_retry(&self, list: Option<&Path>, report: &mut RunReport, guard: &InterruptGuard) -> Result<(), CapsuleError> {
        let list_path = match (list, &self.options.artifact_path) {
            (Some(path), _) => path.to_path_buf(),
            (None, Some(artifact)) => failed_list_path(artifact),
            (None, None) => return Err(CapsuleError::config("no failed-entry list given and artifact location unknown")),
        };
        // the list stays on disk until persist_failures rewrites or clears it
        let previous = FailedList::load(&list_path)?;

        let (mut state, retry) = RunState::seeded(self.options.mode.clone(), previous.entries);
        fs::create_dir_all(&self.target)
            .map_err(|e| CapsuleError::from_io_error(e, "create target directory", Some(self.target.clone())))?;

        for key in &retry {
            guard.check()?;
            let Some(record) = self.artifact.record(key) else {
                warn!("{} is on the failed list but not in the artifact; dropping it", key);
                state.expected_count -= 1;
                continue;
            };
            let outcome = apply_entry(&self.target, record, true);
            state.record(&outcome);
            report.outcomes.push(outcome);
        }
        report.absorb(state);
        Ok(())
    }

    fn run_dry(&self, report: &mut RunReport) -> Result<(), CapsuleError> {
        let mut state = RunState::new(RunMode::DryRun, self.expected_entries(report));
        for record in &self.artifact.records {
            let dest = path_utils::key_to_path(&self.target, &record.relative_path);
            let outcome = match decode_record(record) {
                Ok(_) => {
                    let action = if dest.symlink_metadata().is_ok() { "overwrite" } else { "create" };
                    report.listed.push(format!(
                        "{:<9} {} {} ({} bytes)",
                        action,
                        path_utils::format_mode(record.mode),
                        record.relative_path,
                        record.size
                    ));
                    state.success_count += 1;
                    EntryOutcome::new(&record.relative_path, EntryState::Pending)
                }
                Err(e) => {
                    let outcome = EntryOutcome::failed(&record.relative_path, &e);
                    state.record(&outcome);
                    outcome
                }
            };
            report.outcomes.push(outcome);
        }
        report.absorb(state);
        Ok(())
    }

    fn check_target(&self) -> Result<DigestCheck, CapsuleError> {
        if !self.target.is_dir() {
            return Err(CapsuleError::DirectoryNotFound { path: self.target.clone() });
        }
        let computed = digest::tree_digest(&self.target, &self.artifact.header.exclusions)?;
        let expected = &self.artifact.header.source_hash;
        if computed.matches(expected) {
            info!("digest of {} matches the stamped hash", self.target.display());
        } else {
            warn!("digest mismatch: expected {}, computed {}", expected, computed.hex);
        }
        Ok(DigestCheck {
            expected: expected.clone(),
            file_count: computed.file_count(),
            computed: computed.hex,
        })
    }

    fn run_recalculate(&self, prompt: &mut dyn Prompt, report: &mut RunReport) -> Result<(), CapsuleError> {
        let check = self.check_target()?;
        report.digest = Some(check.clone());
        if check.matches() {
            return Ok(());
        }

        let question = format!("Replace stamped hash {} with {}?", check.expected, check.computed);
        if !prompt.confirm(&question)? {
            info!("hash recalculation declined");
            report.cancelled = true;
            return Ok(());
        }

        let artifact_path = self
            .options
            .artifact_path
            .as_deref()
            .ok_or_else(|| CapsuleError::config("artifact location unknown; cannot rewrite its hash"))?;
        artifact::rewrite_stamped_hash(artifact_path, &check.computed)?;
        report.stamped_rewritten = true;
        Ok(())
    }

    fn run_dump(&self, filter: Option<&str>, report: &mut RunReport) -> Result<(), CapsuleError> {
        let matcher = compare::path_filter(filter)?;
        report.header = Some(self.artifact.header.clone());
        report.dump = self
            .artifact
            .records
            .iter()
            .filter(|r| matcher.as_ref().map_or(true, |m| m.is_match(&r.relative_path)))
            .map(|r| DumpEntry {
                path: r.relative_path.clone(),
                mode: path_utils::format_mode(r.mode),
                kind: r.kind(),
                size: r.size,
                encoding: r.encoding.tag(),
            })
            .collect();
        Ok(())
    }

    fn run_diff(
        &self,
        reference: &Path,
        filter: Option<&str>,
        report: &mut RunReport,
        guard: &InterruptGuard,
    ) -> Result<(), CapsuleError> {
        if !reference.is_dir() {
            return Err(CapsuleError::DirectoryNotFound { path: reference.to_path_buf() });
        }
        let matcher = compare::path_filter(filter)?;
        let mut builder = tempfile::Builder::new();
        builder.prefix("capsule-diff-");
        let scratch = match &self.options.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| CapsuleError::from_io_error(e, "create scratch directory", self.options.scratch_root.clone()))?;
        debug!("decoding into scratch directory {}", scratch.path().display());

        let selected: Vec<&FileRecord> = self
            .artifact
            .records
            .iter()
            .filter(|r| matcher.as_ref().map_or(true, |m| m.is_match(&r.relative_path)))
            .collect();
        let expected = if matcher.is_some() { selected.len() } else { self.expected_entries(report) };
        let mut state = RunState::new(self.options.mode.clone(), expected);
        for record in selected {
            guard.check()?;
            let outcome = apply_entry(scratch.path(), record, true);
            state.record(&outcome);
            report.outcomes.push(outcome);
        }
        report.absorb(state);

        let diff = compare::compare_trees(
            scratch.path(),
            reference,
            &self.artifact.header.exclusions,
            filter,
            Some(guard),
        )?;
        report.diff = Some(diff);
        Ok(())
    }

    /// Entry count declared by the header. A shortfall of parsed records is
    /// noted on the report and fails the run.
    fn expected_entries(&self, report: &mut RunReport) -> usize {
        let declared = self.artifact.header.file_count;
        let present = self.artifact.records.len();
        if present < declared {
            warn!("artifact declares {} entries but only {} are present", declared, present);
            report.missing_records = declared - present;
        }
        declared.max(present)
    }

    fn prepare_target(&self, overwrite: bool) -> Result<(), CapsuleError> {
        match fs::symlink_metadata(&self.target) {
            Ok(meta) if !meta.is_dir() => {
                return Err(CapsuleError::config(format!(
                    "target {} exists and is not a directory",
                    self.target.display()
                )));
            }
            Ok(_) if !overwrite => {
                let mut entries = fs::read_dir(&self.target).map_err(|e| {
                    CapsuleError::from_io_error(e, "read target directory", Some(self.target.clone()))
                })?;
                if entries.next().is_some() {
                    return Err(CapsuleError::TargetNotEmpty { path: self.target.clone() });
                }
            }
            _ => {}
        }
        fs::create_dir_all(&self.target)
            .map_err(|e| CapsuleError::from_io_error(e, "create target directory", Some(self.target.clone())))
    }

    fn persist_failures(&self, report: &mut RunReport) -> Result<(), CapsuleError> {
        let path = match (&self.options.mode, &self.options.artifact_path) {
            (RunMode::RetryFailed { list: Some(list) }, _) => list.clone(),
            (_, Some(artifact)) => failed_list_path(artifact),
            _ => return Ok(()),
        };
        if report.failed.is_empty() {
            return FailedList::clear(&path);
        }
        let list = FailedList {
            artifact: self.artifact.header.name.clone(),
            target: self.target.clone(),
            recorded: Utc::now(),
            entries: report.failed.clone(),
        };
        list.save(&path)?;
        report.failed_list = Some(path);
        Ok(())
    }
}

fn decode_record(record: &FileRecord) -> Result<Vec<u8>, CapsuleError> {
    codec::decode(&record.relative_path, record.size, &record.encoding, &record.payload)
}

/// Decode one record and write it below `root`.
///
/// With `overwrite` unset an existing destination is left alone and the entry
/// is `Skipped`. Create never gets there, since it only accepts an empty
/// target; callers that merge into a populated tree do.
pub fn apply_entry(root: &Path, record: &FileRecord, overwrite: bool) -> EntryOutcome {
    let key = record.relative_path.as_str();
    let dest = path_utils::key_to_path(root, key);

    if !overwrite && dest.symlink_metadata().is_ok() {
        debug!("{} exists; skipping", key);
        return EntryOutcome::new(key, EntryState::Skipped);
    }

    // Decoding
    let content = match decode_record(record) {
        Ok(content) => content,
        Err(e) => {
            warn!("{}", e.to_string().lines().next().unwrap_or_default());
            return EntryOutcome::failed(key, &e);
        }
    };

    let written = match write_entry(root, key, &content) {
        Ok(path) => path,
        Err(e) => {
            warn!("{}", e.to_string().lines().next().unwrap_or_default());
            return EntryOutcome::failed(key, &e);
        }
    };

    match apply_mode(&written, record.mode) {
        Ok(()) => EntryOutcome::new(key, EntryState::PermissionsApplied),
        Err(e) => {
            warn!("cannot set mode {} on {}: {}", path_utils::format_mode(record.mode), key, e);
            EntryOutcome::new(key, EntryState::Written)
        }
    }
}

/// Stage the content in a temp file beside the destination and rename it into
/// place. The rename replaces a read-only file or a symlink without touching
/// what the link points at, and a failed write leaves nothing behind.
fn write_entry(root: &Path, key: &str, content: &[u8]) -> Result<PathBuf, CapsuleError> {
    let write_err = |reason: String| CapsuleError::Write { path: key.to_string(), reason };

    let (parents, name) = key.rsplit_once('/').unwrap_or(("", key));
    let parent = create_parents(root, parents).map_err(write_err)?;
    let dest = parent.join(name);
    if fs::symlink_metadata(&dest).is_ok_and(|meta| meta.is_dir()) {
        return Err(write_err(format!("{} is a directory", dest.display())));
    }

    let mut staged = tempfile::Builder::new()
        .prefix(".capsule-entry-")
        .tempfile_in(&parent)
        .map_err(|e| write_err(format!("cannot stage file: {}", e)))?;
    staged
        .write_all(content)
        .and_then(|()| staged.flush())
        .map_err(|e| write_err(e.to_string()))?;
    staged.persist(&dest).map_err(|e| write_err(e.error.to_string()))?;
    Ok(dest)
}

/// Create the directories of `parents` (a `/`-separated relative path) below
/// `root`, one level at a time. A symlink or a non-directory on the way is an
/// error, so nothing is ever written outside `root`.
fn create_parents(root: &Path, parents: &str) -> Result<PathBuf, String> {
    fs::create_dir_all(root).map_err(|e| format!("cannot create {}: {}", root.display(), e))?;
    let mut dir = root.to_path_buf();
    for part in parents.split('/').filter(|p| !p.is_empty()) {
        dir.push(part);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(format!("{} is a symlink; refusing to write through it", dir.display()));
            }
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(format!("{} exists and is not a directory", dir.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&dir).map_err(|e| format!("cannot create parent directory {}: {}", dir.display(), e))?;
            }
            Err(e) => return Err(format!("cannot inspect {}: {}", dir.display(), e)),
        }
    }
    Ok(dir)
}

#[cfg(unix)]
fn apply_mode(dest: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dest, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(dest: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(dest)?.permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(dest, permissions)
}
