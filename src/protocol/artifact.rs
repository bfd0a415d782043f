//! Artifact model, writer and parser.
//!
//! An artifact is a line-structured file: a `#!` line, `# key: value` header
//! fields, a table of contents, then one marked region per file:
//!
//! ```text
//! #@@ BEGIN src/main.rs
//! #@ mode: 644
//! #@ kind: text
//! #@ size: 13
//! #@ encoding: escaped
//! <<CAPSULE_0f3c..._SRC_MAIN_RS
//! fn main() {}
//!
//! CAPSULE_0f3c..._SRC_MAIN_RS
//! #@@ END src/main.rs
//! ```
//!
//! Exactly one `\n` separates the payload from its closing delimiter line.
//! The only field rewritten after creation is `# sha256:`.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::codec::{EncodedPayload, PayloadEncoding};
use super::error::CapsuleError;
use super::exclude::ExclusionRules;
use super::path_utils;
use super::scan::SourceEntry;

pub const SHEBANG: &str = "#!/usr/bin/env -S capsule run";
pub const FORMAT_VERSION: u32 = 1;

const HASH_FIELD: &str = "# sha256: ";
const BEGIN_MARKER: &str = "#@@ BEGIN ";
const END_MARKER: &str = "#@@ END ";
const RECORD_FIELD: &str = "#@ ";
const PAYLOAD_OPEN: &str = "<<";

/// Header fields of an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactHeader {
    pub name: String,
    pub version: String,
    pub created: DateTime<Utc>,
    /// Stamped tree digest (hex SHA-256).
    pub source_hash: String,
    pub file_count: usize,
    pub total_size: u64,
    /// Rules in serialized (relative) form, used again at verification time.
    pub exclusions: ExclusionRules,
    pub metadata: Vec<String>,
    pub generator: String,
}

impl ArtifactHeader {
    /// Directory name used when no target directory is given.
    pub fn default_target_name(&self) -> String {
        let name = self.name.trim();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            "capsule".to_string()
        } else {
            name.to_string()
        }
    }
}

/// One embedded file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub relative_path: String,
    pub mode: u32,
    pub is_binary: bool,
    pub size: u64,
    pub encoding: PayloadEncoding,
    pub delimiter: String,
    pub payload: Vec<u8>,
}

impl FileRecord {
    pub fn new(entry: &SourceEntry, encoded: EncodedPayload) -> Self {
        Self {
            relative_path: entry.relative_path.clone(),
            mode: entry.permission_bits,
            is_binary: entry.is_binary,
            size: entry.size_bytes,
            encoding: encoded.encoding,
            delimiter: encoded.delimiter,
            payload: encoded.body,
        }
    }

    pub fn kind(&self) -> &'static str {
        if self.is_binary {
            "binary"
        } else {
            "text"
        }
    }
}

/// A parsed or freshly assembled artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub header: ArtifactHeader,
    pub records: Vec<FileRecord>,
}

impl Artifact {
    pub fn record(&self, key: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.relative_path == key)
    }

    /// Serialize the artifact. Returns the byte offset of each `BEGIN` marker.
    pub fn write_to<W: Write>(&self, writer: W) -> io::Result<BTreeMap<String, u64>> {
        let mut out = CountingWriter { inner: writer, written: 0 };
        let header = &self.header;

        writeln!(out, "{}", SHEBANG)?;
        writeln!(out, "# capsule-format: {}", FORMAT_VERSION)?;
        writeln!(out, "# generator: {}", single_line(&header.generator))?;
        writeln!(out, "# name: {}", single_line(&header.name))?;
        writeln!(out, "# version: {}", single_line(&header.version))?;
        writeln!(out, "# created: {}", header.created.to_rfc3339())?;
        writeln!(out, "{}{}", HASH_FIELD, header.source_hash)?;
        writeln!(out, "# files: {}", header.file_count)?;
        writeln!(out, "# total-size: {}", header.total_size)?;
        writeln!(out, "# exclusions: {}", header.exclusions.to_json())?;
        for line in &header.metadata {
            writeln!(out, "# meta: {}", single_line(line))?;
        }

        let mut toc: Vec<&FileRecord> = self.records.iter().collect();
        toc.sort_by(|a, b| a.relative_path.as_bytes().cmp(b.relative_path.as_bytes()));
        for record in toc {
            writeln!(
                out,
                "# toc: {}\t{}\t{}\t{}",
                record.size,
                path_utils::format_mode(record.mode),
                record.kind(),
                record.relative_path
            )?;
        }

        let mut offsets = BTreeMap::new();
        for record in &self.records {
            offsets.insert(record.relative_path.clone(), out.written);
            writeln!(out, "{}{}", BEGIN_MARKER, record.relative_path)?;
            writeln!(out, "{}mode: {}", RECORD_FIELD, path_utils::format_mode(record.mode))?;
            writeln!(out, "{}kind: {}", RECORD_FIELD, record.kind())?;
            writeln!(out, "{}size: {}", RECORD_FIELD, record.size)?;
            writeln!(out, "{}encoding: {}", RECORD_FIELD, record.encoding.tag())?;
            if let PayloadEncoding::Base64 { chunks, blob_sha256, .. } = &record.encoding {
                writeln!(out, "{}chunks: {}", RECORD_FIELD, chunks)?;
                writeln!(out, "{}blob-sha256: {}", RECORD_FIELD, blob_sha256)?;
            }
            writeln!(out, "{}{}", PAYLOAD_OPEN, record.delimiter)?;
            out.write_all(&record.payload)?;
            write!(out, "\n{}\n", record.delimiter)?;
            writeln!(out, "{}{}", END_MARKER, record.relative_path)?;
        }
        out.flush()?;
        Ok(offsets)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    /// Read and parse an artifact file.
    pub fn read_from(path: &Path) -> Result<Self, CapsuleError> {
        let data = fs::read(path).map_err(|e| CapsuleError::from_io_error(e, "read artifact", Some(path.to_path_buf())))?;
        Self::parse(&data)
    }

    /// Parse artifact bytes.
    pub fn parse(data: &[u8]) -> Result<Self, CapsuleError> {
        let mut cursor = Cursor { data, pos: 0, line: 0 };
        let header = parse_header(&mut cursor)?;

        let mut records = Vec::new();
        while let Some(line) = cursor.peek_line() {
            if line.trim().is_empty() {
                cursor.next_line();
                continue;
            }
            records.push(parse_record(&mut cursor)?);
        }

        if records.len() != header.file_count {
            warn!("artifact header declares {} files but {} records were found", header.file_count, records.len());
        }
        debug!("parsed artifact '{}' with {} records", header.name, records.len());
        Ok(Self { header, records })
    }
}

/// Replace the stamped digest of an artifact file in place.
///
/// The original is copied to a backup next to it first. The replacement is
/// renamed over the original, so a failure normally leaves it intact; the
/// backup is restored only when it did not, and is removed otherwise.
pub fn rewrite_stamped_hash(path: &Path, new_hex: &str) -> Result<(), CapsuleError> {
    if new_hex.len() != 64 || !new_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CapsuleError::config(format!("'{}' is not a SHA-256 digest", new_hex)));
    }
    let io_err = |e: io::Error, op: &str| CapsuleError::from_io_error(e, op, Some(path.to_path_buf()));

    let original = fs::read(path).map_err(|e| io_err(e, "read artifact"))?;
    let permissions = fs::metadata(path).map_err(|e| io_err(e, "read artifact"))?.permissions();
    let updated = replace_hash_line(&original, new_hex)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut backup = tempfile::Builder::new()
        .prefix(".capsule-backup-")
        .tempfile_in(dir)
        .map_err(|e| io_err(e, "create backup"))?;
    backup.write_all(&original).map_err(|e| io_err(e, "write backup"))?;
    backup.flush().map_err(|e| io_err(e, "write backup"))?;
    debug!("backup of {} at {}", path.display(), backup.path().display());

    match write_replacement(dir, path, &updated, permissions) {
        Ok(()) => {
            info!("stamped hash of {} updated to {}", path.display(), new_hex);
            Ok(())
        }
        Err(e) => {
            warn!("hash rewrite of {} failed: {}", path.display(), e);
            restore_if_changed(path, &original, backup)?;
            Err(e)
        }
    }
}

/// Put the backup back when `path` no longer holds `original`. A backup that
/// cannot be restored is kept on disk and named in the error.
fn restore_if_changed(path: &Path, original: &[u8], backup: NamedTempFile) -> Result<(), CapsuleError> {
    if fs::read(path).is_ok_and(|current| current == original) {
        debug!("{} is intact; backup discarded", path.display());
        return Ok(());
    }
    warn!("restoring {} from backup", path.display());
    let Err(restore) = fs::copy(backup.path(), path) else {
        return Ok(());
    };
    let kept = match backup.keep() {
        Ok((_, kept)) => kept.display().to_string(),
        Err(e) => format!("unavailable ({})", e.error),
    };
    Err(CapsuleError::Write {
        path: path.display().to_string(),
        reason: format!("restoring the original failed: {}; backup kept at {}", restore, kept),
    })
}

fn write_replacement(dir: &Path, path: &Path, bytes: &[u8], permissions: fs::Permissions) -> Result<(), CapsuleError> {
    let io_err = |e: io::Error, op: &str| CapsuleError::from_io_error(e, op, Some(path.to_path_buf()));
    let mut replacement: NamedTempFile = tempfile::Builder::new()
        .prefix(".capsule-rewrite-")
        .tempfile_in(dir)
        .map_err(|e| io_err(e, "create temp file"))?;
    replacement.write_all(bytes).map_err(|e| io_err(e, "write artifact"))?;
    replacement.flush().map_err(|e| io_err(e, "write artifact"))?;
    fs::set_permissions(replacement.path(), permissions).map_err(|e| io_err(e, "set permissions"))?;
    replacement.persist(path).map_err(|e| io_err(e.error, "replace artifact"))?;
    Ok(())
}

fn replace_hash_line(data: &[u8], new_hex: &str) -> Result<Vec<u8>, CapsuleError> {
    let mut pos = 0;
    let mut line_no = 0;
    while pos < data.len() {
        line_no += 1;
        let end = data[pos..].iter().position(|b| *b == b'\n').map_or(data.len(), |i| pos + i);
        let line = &data[pos..end];
        if line.starts_with(BEGIN_MARKER.as_bytes()) {
            break;
        }
        if line.starts_with(HASH_FIELD.as_bytes()) {
            let mut out = Vec::with_capacity(data.len());
            out.extend_from_slice(&data[..pos]);
            out.extend_from_slice(HASH_FIELD.as_bytes());
            out.extend_from_slice(new_hex.as_bytes());
            out.extend_from_slice(&data[end..]);
            debug!("replaced stamped hash on line {}", line_no);
            return Ok(out);
        }
        pos = end + 1;
    }
    Err(CapsuleError::ArtifactFormat { line: line_no, reason: "no stamped hash field in header".to_string() })
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn line_end(&self) -> usize {
        self.data[self.pos..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(self.data.len(), |i| self.pos + i)
    }

    fn peek_line(&self) -> Option<String> {
        if self.pos >= self.data.len() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.data[self.pos..self.line_end()]).into_owned())
    }

    fn next_line(&mut self) -> Option<String> {
        let line = self.peek_line()?;
        self.pos = (self.line_end() + 1).min(self.data.len());
        self.line += 1;
        Some(line)
    }

    fn error(&self, reason: impl Into<String>) -> CapsuleError {
        CapsuleError::ArtifactFormat { line: self.line, reason: reason.into() }
    }

    /// Take the payload up to `\n<delimiter>` followed by a newline or EOF.
    fn take_payload(&mut self, delimiter: &str) -> Result<&'a [u8], CapsuleError> {
        let rest = &self.data[self.pos..];
        let mut needle = Vec::with_capacity(delimiter.len() + 1);
        needle.push(b'\n');
        needle.extend_from_slice(delimiter.as_bytes());

        // An empty payload puts the separator newline right at the cursor
        let mut search = 0;
        while let Some(found) = find(&rest[search..], &needle) {
            let at = search + found;
            let after = at + needle.len();
            if after == rest.len() || rest[after] == b'\n' {
                let payload = &rest[..at];
                self.line += payload.iter().filter(|b| **b == b'\n').count() + 1;
                self.pos += (after + 1).min(rest.len());
                return Ok(payload);
            }
            search = at + 1;
        }
        Err(self.error(format!("closing delimiter {} not found", delimiter)))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_header(cursor: &mut Cursor<'_>) -> Result<ArtifactHeader, CapsuleError> {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut metadata = Vec::new();
    let mut format_seen = false;

    if cursor.peek_line().is_some_and(|l| l.starts_with("#!")) {
        cursor.next_line();
    }

    while let Some(line) = cursor.peek_line() {
        if line.starts_with(BEGIN_MARKER) {
            break;
        }
        cursor.next_line();
        if line.trim().is_empty() {
            continue;
        }
        let Some(body) = line.strip_prefix("# ") else {
            return Err(cursor.error(format!("unexpected header line '{}'", line)));
        };
        let Some((key, value)) = body.split_once(':') else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value).to_string();
        match key {
            "capsule-format" => {
                if value.trim() != FORMAT_VERSION.to_string() {
                    return Err(cursor.error(format!("unsupported capsule format '{}'", value.trim())));
                }
                format_seen = true;
            }
            "meta" => metadata.push(value),
            "toc" => {}
            _ => {
                fields.insert(key.to_string(), value);
            }
        }
    }

    if !format_seen {
        return Err(cursor.error("not a capsule artifact (missing capsule-format field)"));
    }

    let mut take = |key: &str| fields.remove(key);
    let name = take("name").ok_or_else(|| cursor.error("header has no name"))?;
    let source_hash = take("sha256").map(|h| h.trim().to_string()).ok_or_else(|| cursor.error("header has no sha256"))?;
    let exclusions = match take("exclusions") {
        Some(json) => ExclusionRules::from_json(&json).map_err(|e| cursor.error(format!("malformed exclusions: {}", e)))?,
        None => ExclusionRules::new(),
    };
    let created = match take("created") {
        Some(text) => DateTime::parse_from_rfc3339(text.trim())
            .map_err(|e| cursor.error(format!("malformed created timestamp: {}", e)))?
            .with_timezone(&Utc),
        None => DateTime::<Utc>::UNIX_EPOCH,
    };
    let number = |value: Option<String>, field: &str| -> Result<u64, CapsuleError> {
        match value {
            Some(v) => v.trim().parse().map_err(|_| cursor.error(format!("malformed {} field", field))),
            None => Ok(0),
        }
    };
    let file_count = number(take("files"), "files")? as usize;
    let total_size = number(take("total-size"), "total-size")?;

    Ok(ArtifactHeader {
        name,
        version: take("version").unwrap_or_else(|| "0.0.0".to_string()),
        created,
        source_hash,
        file_count,
        total_size,
        exclusions,
        metadata,
        generator: take("generator").unwrap_or_default(),
    })
}

fn parse_record(cursor: &mut Cursor<'_>) -> Result<FileRecord, CapsuleError> {
    let begin = cursor.next_line().unwrap_or_default();
    let Some(path) = begin.strip_prefix(BEGIN_MARKER) else {
        return Err(cursor.error(format!("expected entry marker, found '{}'", begin)));
    };
    let relative_path = path.to_string();
    if !path_utils::is_safe_key(&relative_path) {
        return Err(cursor.error(format!("unsafe entry path '{}'", relative_path)));
    }

    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let delimiter = loop {
        let line = cursor
            .next_line()
            .ok_or_else(|| cursor.error(format!("entry {} ends before its payload", relative_path)))?;
        if let Some(delimiter) = line.strip_prefix(PAYLOAD_OPEN) {
            break delimiter.trim().to_string();
        }
        let field = line
            .strip_prefix(RECORD_FIELD)
            .and_then(|f| f.split_once(':'))
            .ok_or_else(|| cursor.error(format!("unexpected line '{}' in entry {}", line, relative_path)))?;
        fields.insert(field.0.trim().to_string(), field.1.trim().to_string());
    };
    if delimiter.is_empty() {
        return Err(cursor.error(format!("entry {} has an empty delimiter", relative_path)));
    }

    let payload = cursor.take_payload(&delimiter)?.to_vec();

    let end = cursor.next_line().unwrap_or_default();
    if end.strip_prefix(END_MARKER) != Some(relative_path.as_str()) {
        return Err(cursor.error(format!("entry {} is not closed by its END marker", relative_path)));
    }

    let mode = fields
        .get("mode")
        .and_then(|m| path_utils::parse_mode(m))
        .ok_or_else(|| cursor.error(format!("entry {} has no valid mode", relative_path)))?;
    let is_binary = match fields.get("kind").map(String::as_str) {
        Some("binary") => true,
        Some("text") | None => false,
        Some(other) => return Err(cursor.error(format!("unknown kind '{}'", other))),
    };
    let size = fields
        .get("size")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| cursor.error(format!("entry {} has no valid size", relative_path)))?;
    let chunks = fields.get("chunks").and_then(|c| c.parse().ok());
    let tag = fields.get("encoding").map(String::as_str).unwrap_or("escaped");
    let encoding = PayloadEncoding::from_tag(tag, chunks, fields.get("blob-sha256").cloned())
        .ok_or_else(|| cursor.error(format!("entry {} has unusable encoding '{}'", relative_path, tag)))?;

    Ok(FileRecord { relative_path, mode, is_binary, size, encoding, delimiter, payload })
}
