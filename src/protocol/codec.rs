//! Content codec: turns file bytes into an embeddable payload block and back.
//!
//! Text is embedded verbatim with `\`, `$` and backtick escaped by a
//! preceding backslash. Binary is optionally compressed, base64-encoded,
//! split into `#@chunk i/n` segments and wrapped at 76 columns; the SHA-256
//! of the reassembled encoded text is recorded so a damaged segment is caught
//! before decoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::classify::Classification;
use super::compression::{self, PayloadCompression};
use super::error::CapsuleError;
use super::path_utils;

pub const DELIMITER_PREFIX: &str = "CAPSULE_";
pub const CHUNK_MARKER: &str = "#@chunk ";
const WRAP_COLUMNS: usize = 76;
const MAX_DELIMITER_ATTEMPTS: usize = 8;

/// How a payload block was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Text with metacharacters backslash-escaped.
    Escaped,
    /// Transport-encoded binary.
    Base64 {
        compression: PayloadCompression,
        chunks: usize,
        blob_sha256: String,
    },
}

impl PayloadEncoding {
    /// Value written to the `#@ encoding:` record line.
    pub fn tag(&self) -> String {
        match self {
            Self::Escaped => "escaped".to_string(),
            Self::Base64 { compression: PayloadCompression::None, .. } => "base64".to_string(),
            Self::Base64 { compression, .. } => format!("base64+{}", compression.label()),
        }
    }

    /// Parse an `encoding` tag; base64 variants need their chunk metadata.
    pub fn from_tag(tag: &str, chunks: Option<usize>, blob_sha256: Option<String>) -> Option<Self> {
        if tag == "escaped" {
            return Some(Self::Escaped);
        }
        let compression = match tag.strip_prefix("base64") {
            Some("") => PayloadCompression::None,
            Some(rest) => PayloadCompression::parse(rest.strip_prefix('+')?)?,
            None => return None,
        };
        Some(Self::Base64 {
            compression,
            chunks: chunks.unwrap_or(1),
            blob_sha256: blob_sha256?,
        })
    }
}

/// Encoder settings for binary payloads.
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    /// Maximum encoded characters per segment; 0 keeps one segment.
    pub chunk_size: usize,
    pub compression: PayloadCompression,
    /// 1-9, clamped when used.
    pub level: u8,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            compression: PayloadCompression::Gzip,
            level: compression::DEFAULT_LEVEL,
        }
    }
}

/// An encoded entry, ready to be placed between its delimiter lines.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub encoding: PayloadEncoding,
    pub delimiter: String,
    pub body: Vec<u8>,
}

/// Encode `content` for the entry `key`.
pub fn encode(
    key: &str,
    content: &[u8],
    class: Classification,
    options: &CodecOptions,
) -> Result<EncodedPayload, CapsuleError> {
    let (encoding, body) = match class {
        Classification::Text => (PayloadEncoding::Escaped, escape_text(content)),
        Classification::Binary => encode_binary(key, content, options)?,
    };

    for _ in 0..MAX_DELIMITER_ATTEMPTS {
        let delimiter = generate_delimiter(key);
        if !contains(&body, delimiter.as_bytes()) {
            return Ok(EncodedPayload { encoding, delimiter, body });
        }
        debug!("delimiter collided with content of {}; regenerating", key);
    }

    Err(CapsuleError::Encode {
        path: key.to_string(),
        reason: "could not generate a delimiter absent from the content".to_string(),
    })
}

/// Decode a payload body back into the original bytes.
pub fn decode(key: &str, expected_size: u64, encoding: &PayloadEncoding, body: &[u8]) -> Result<Vec<u8>, CapsuleError> {
    let bytes = match encoding {
        PayloadEncoding::Escaped => unescape_text(body).map_err(|reason| decode_error(key, reason))?,
        PayloadEncoding::Base64 { compression, chunks, blob_sha256 } => {
            let blob = reassemble(body, *chunks).map_err(|reason| decode_error(key, reason))?;
            let actual = hex::encode(Sha256::digest(&blob));
            if !actual.eq_ignore_ascii_case(blob_sha256) {
                return Err(decode_error(
                    key,
                    format!("reassembled payload digest {} does not match recorded {}", actual, blob_sha256),
                ));
            }
            let packed = STANDARD
                .decode(&blob)
                .map_err(|e| decode_error(key, format!("malformed base64: {}", e)))?;
            compression.unpack(&packed)
                .map_err(|e| decode_error(key, format!("{} decompression failed: {}", compression.label(), e)))?
        }
    };

    if bytes.len() as u64 != expected_size {
        return Err(decode_error(
            key,
            format!("decoded {} bytes, expected {}", bytes.len(), expected_size),
        ));
    }
    Ok(bytes)
}

fn decode_error(key: &str, reason: impl Into<String>) -> CapsuleError {
    CapsuleError::Decode { path: key.to_string(), reason: reason.into() }
}

/// Escape `\`, `$` and backtick with a preceding backslash.
pub fn escape_text(content: &[u8]) -> Vec<u8> {
    let extra = content.iter().filter(|b| is_meta(**b)).count();
    let mut out = Vec::with_capacity(content.len() + extra);
    for &b in content {
        if is_meta(b) {
            out.push(b'\\');
        }
        out.push(b);
    }
    out
}

/// Exact inverse of [`escape_text`].
pub fn unescape_text(body: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied().enumerate();
    while let Some((offset, b)) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some((_, next)) if is_meta(next) => out.push(next),
            Some((_, next)) => {
                return Err(format!("invalid escape '\\{}' at offset {}", next as char, offset));
            }
            None => return Err("dangling escape at end of payload".to_string()),
        }
    }
    Ok(out)
}

fn is_meta(b: u8) -> bool {
    matches!(b, b'\\' | b'$' | b'`')
}

fn encode_binary(
    key: &str,
    content: &[u8],
    options: &CodecOptions,
) -> Result<(PayloadEncoding, Vec<u8>), CapsuleError> {
    let encode_err = |reason: String| CapsuleError::Encode { path: key.to_string(), reason };

    let mut compression_used = PayloadCompression::None;
    let mut packed = content.to_vec();
    if options.compression != PayloadCompression::None && !compression::is_precompressed(key) {
        let candidate = options
            .compression
            .pack(content, options.level)
            .map_err(|e| encode_err(format!("{} compression failed: {}", options.compression.label(), e)))?;
        if candidate.len() < content.len() {
            compression_used = options.compression;
            packed = candidate;
        }
    }

    let encoded = STANDARD.encode(&packed);
    let expected_len = packed.len().div_ceil(3) * 4;
    if encoded.len() != expected_len || (!packed.is_empty() && encoded.is_empty()) {
        return Err(encode_err(format!(
            "transport encoding produced {} characters, expected {}",
            encoded.len(),
            expected_len
        )));
    }

    let blob_sha256 = hex::encode(Sha256::digest(encoded.as_bytes()));
    let segments: Vec<&[u8]> = if options.chunk_size == 0 || encoded.is_empty() {
        vec![encoded.as_bytes()]
    } else {
        encoded.as_bytes().chunks(options.chunk_size).collect()
    };

    let total = segments.len();
    let mut body = Vec::with_capacity(encoded.len() + encoded.len() / WRAP_COLUMNS + total * 24);
    for (index, segment) in segments.iter().enumerate() {
        if index > 0 {
            body.push(b'\n');
        }
        body.extend_from_slice(format!("{}{}/{}", CHUNK_MARKER, index + 1, total).as_bytes());
        for line in segment.chunks(WRAP_COLUMNS) {
            body.push(b'\n');
            body.extend_from_slice(line);
        }
    }

    let encoding = PayloadEncoding::Base64 {
        compression: compression_used,
        chunks: total,
        blob_sha256,
    };
    Ok((encoding, body))
}

fn reassemble(body: &[u8], declared: usize) -> Result<Vec<u8>, String> {
    let mut segments: Vec<Vec<u8>> = Vec::new();
    for line in body.split(|b| *b == b'\n') {
        let line = trim_ascii(line);
        if line.is_empty() {
            continue;
        }
        if let Some(marker) = line.strip_prefix(CHUNK_MARKER.as_bytes()) {
            let marker = String::from_utf8_lossy(marker);
            let (index, total) = marker
                .split_once('/')
                .and_then(|(i, n)| Some((i.trim().parse::<usize>().ok()?, n.trim().parse::<usize>().ok()?)))
                .ok_or_else(|| format!("malformed chunk marker '{}'", marker))?;
            if index != segments.len() + 1 || total != declared {
                return Err(format!(
                    "chunk {}/{} out of sequence (expected {}/{})",
                    index,
                    total,
                    segments.len() + 1,
                    declared
                ));
            }
            segments.push(Vec::new());
            continue;
        }
        match segments.last_mut() {
            Some(segment) => segment.extend_from_slice(line),
            None => return Err("payload data before first chunk marker".to_string()),
        }
    }
    if segments.len() != declared {
        return Err(format!("found {} chunks, expected {}", segments.len(), declared));
    }
    Ok(segments.concat())
}

fn trim_ascii(mut line: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = line {
        if first.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = line {
        if last.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    line
}

/// `CAPSULE_<entropy>_<SANITIZED_KEY>`.
pub fn generate_delimiter(key: &str) -> String {
    format!("{}{}_{}", DELIMITER_PREFIX, entropy_token(), path_utils::sanitize_for_token(key))
}

fn entropy_token() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes).into_uuid().simple().to_string(),
        Err(e) => {
            debug!("OS randomness unavailable ({}); using timestamp token", e);
            fallback_token()
        }
    }
}

fn fallback_token() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    let mut rng = StdRng::seed_from_u64(nanos ^ ((std::process::id() as u64) << 32));
    format!("{:016x}{:016x}", nanos, rng.gen::<u64>())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
