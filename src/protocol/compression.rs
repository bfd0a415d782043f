//! Payload compression for binary entries.
//!
//! A binary payload is compressed before transport encoding only when the
//! result is strictly smaller and the file is not a known compressed format.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};
use std::path::Path;

pub const DEFAULT_LEVEL: u8 = 6;

/// File extensions whose content is already compressed; recompressing them
/// wastes time for no gain.
const PRECOMPRESSED: &[&str] = &[
    "gz", "tgz", "zst", "zip", "7z", "rar", "xz", "bz2", "lz4", "lzma", "jar", "whl", "jpg", "jpeg", "png", "gif",
    "webp", "mp3", "mp4", "mkv", "mov", "webm", "flac", "ogg", "woff", "woff2", "pdf", "docx", "xlsx", "pptx",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadCompression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl PayloadCompression {
    /// Suffix used in `base64+<label>` encoding tags and in configuration.
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Some(Self::None),
            "gzip" | "gz" => Some(Self::Gzip),
            "zstd" | "zst" => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Compress `data`; `level` is clamped to 1-9.
    pub fn pack(self, data: &[u8], level: u8) -> io::Result<Vec<u8>> {
        let level = level.clamp(1, 9);
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), flate2::Compression::new(level.into()));
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::Zstd => zstd::encode_all(data, level.into()),
        }
    }

    pub fn unpack(self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
            Self::Zstd => zstd::decode_all(data),
        }
    }
}

/// Whether the relative path names a format that is compressed already.
pub fn is_precompressed(key: &str) -> bool {
    Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PRECOMPRESSED.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}
