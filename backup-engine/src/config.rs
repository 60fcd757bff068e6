//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file. Every section is optional and falls
//! back to defaults, so a config file only needs to name the target.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::archive::MAX_FOOTER_SIZE;
use crate::executor::volume::VOLUME_FUDGE;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub testing: TestingConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Backend URL, e.g. `file:///srv/backups/host1`
    #[serde(default = "default_target_url")]
    pub target_url: String,

    /// Local cache of manifests and signatures
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Scratch space for volumes awaiting upload
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Prepended to every generated filename
    #[serde(default)]
    pub file_prefix: String,

    /// Generate base36 short filenames
    #[serde(default)]
    pub short_filenames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume size budget in bytes (default: 200MB)
    #[serde(default = "default_volsize")]
    pub volsize: u64,

    /// Largest block the archive source may yield (default: 64KB)
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    /// Compression algorithm (zstd, none)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Whether the volume codec encrypts
    #[serde(default)]
    pub encryption: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Concurrent volume uploads; 0 uploads synchronously
    #[serde(default)]
    pub concurrency: usize,

    /// Attempts per backend call before giving up
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory to back up
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Glob-style exclude patterns
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Force a full backup when the last full is older than this (seconds)
    #[serde(default)]
    pub full_if_older_than: Option<i64>,

    /// Skip writing an incremental that contains no changes
    #[serde(default)]
    pub skip_if_no_change: bool,

    /// Write a jsonstat file per backup set
    #[serde(default)]
    pub jsonstat: bool,

    /// Test-decode volume 1 before trusting a restart
    #[serde(default = "default_true")]
    pub validate_restart: bool,

    /// Fail when the local and remote manifests disagree
    #[serde(default = "default_true")]
    pub check_remote_manifest: bool,

    /// Restarts from scratch before giving up
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
}

/// Fault injection hooks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestingConfig {
    /// Seal this volume but never upload it
    #[serde(default)]
    pub skip_volume: Option<u32>,

    /// Abort right after this volume is committed
    #[serde(default)]
    pub fail_on_volume: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also append log lines to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
fn default_target_url() -> String {
    "file:///var/backups/backup-engine".to_string()
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/cache/backup-engine")
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_volsize() -> u64 {
    200 * 1024 * 1024 // 200MB
}

fn default_max_block_size() -> usize {
    64 * 1024 // 64KB
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_num_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            target_url: default_target_url(),
            archive_dir: default_archive_dir(),
            temp_dir: default_temp_dir(),
            file_prefix: String::new(),
            short_filenames: false,
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            volsize: default_volsize(),
            max_block_size: default_max_block_size(),
            compression: default_compression(),
            compression_level: default_compression_level(),
            encryption: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            concurrency: 0,
            num_retries: default_num_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            source_dir: default_source_dir(),
            exclude: Vec::new(),
            full_if_older_than: None,
            skip_if_no_change: false,
            jsonstat: false,
            validate_restart: default_true(),
            check_remote_manifest: default_true(),
            max_restart_attempts: default_max_restart_attempts(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            archive: ArchiveConfig::default(),
            volume: VolumeConfig::default(),
            upload: UploadConfig::default(),
            backup: BackupConfig::default(),
            testing: TestingConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Volumes must leave room for the fudge and footer.
        if self.volume.volsize < 1024 * 1024 {
            return Err(EngineError::Config(format!(
                "volsize {} is below the 1MB minimum",
                self.volume.volsize
            )));
        }
        if self.volume.max_block_size == 0 {
            return Err(EngineError::Config("max_block_size must be positive".into()));
        }
        let per_volume = self.volume.max_block_size as u64 + MAX_FOOTER_SIZE + VOLUME_FUDGE;
        if per_volume > self.volume.volsize {
            return Err(EngineError::Config(format!(
                "max_block_size {} does not fit a {} byte volume",
                self.volume.max_block_size, self.volume.volsize
            )));
        }
        match self.volume.compression.as_str() {
            "zstd" | "none" => {}
            other => {
                return Err(EngineError::Config(format!(
                    "unsupported compression: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Whether filenames carry the compressed suffix.
    pub fn compressed(&self) -> bool {
        self.volume.compression != "none"
    }
}
