//! Configuration layer.
//!
//! Settings come from `capsule.toml`, looked up in this order: an explicit
//! `--config` path, `capsule.toml` in the source directory, the user config
//! directory (`~/.config/capsule/config.toml` on Linux), then built-in
//! defaults. Command-line flags are applied on top by the caller.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::protocol::classify::ClassifierPolicy;
use crate::protocol::codec::CodecOptions;
use crate::protocol::compression::PayloadCompression;
use crate::protocol::error::CapsuleError;

/// File name looked up in the source directory.
pub const PROJECT_CONFIG: &str = "capsule.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapsuleConfig {
    /// Extra exclusion patterns, appended after the defaults.
    pub exclude: Vec<String>,
    pub include_vcs: bool,
    /// Encoded characters per binary segment; 0 keeps one segment.
    pub chunk_size: usize,
    /// `none`, `gzip` or `zstd`.
    pub compression: String,
    pub compression_level: u8,
    /// Write `<artifact>.index.json` next to the artifact.
    pub write_index: bool,
    pub classifier: ClassifierPolicy,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        let codec = CodecOptions::default();
        Self {
            exclude: Vec::new(),
            include_vcs: false,
            chunk_size: codec.chunk_size,
            compression: codec.compression.label().to_string(),
            compression_level: codec.level,
            write_index: false,
            classifier: ClassifierPolicy::default(),
        }
    }
}

impl CapsuleConfig {
    /// Resolve and load configuration for a pack of `source`.
    pub fn load(explicit: Option<&Path>, source: Option<&Path>) -> Result<Self, CapsuleError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = source.map(|s| s.join(PROJECT_CONFIG)).filter(|p| p.is_file()) {
            return Self::from_file(&path);
        }
        if let Some(path) = Self::user_config_path().filter(|p| p.is_file()) {
            return Self::from_file(&path);
        }
        debug!("no configuration file found; using defaults");
        Ok(Self::default())
    }

    /// `<config dir>/capsule/config.toml`, if the platform has a config dir.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("capsule").join("config.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self, CapsuleError> {
        let content = fs::read_to_string(path)
            .map_err(|e| CapsuleError::config(format!("cannot read config {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| CapsuleError::config(format!("{}: {}", path.display(), e)))?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CapsuleError> {
        let config: Self =
            toml::from_str(content).map_err(|e| CapsuleError::config(format!("invalid configuration: {}", e)))?;
        config.codec_options()?;
        Ok(config)
    }

    /// Codec settings derived from this configuration.
    pub fn codec_options(&self) -> Result<CodecOptions, CapsuleError> {
        let compression = PayloadCompression::parse(&self.compression).ok_or_else(|| {
            CapsuleError::config(format!("unknown compression '{}' (expected none, gzip or zstd)", self.compression))
        })?;
        Ok(CodecOptions {
            chunk_size: self.chunk_size,
            compression,
            level: self.compression_level.clamp(1, 9),
        })
    }
}
