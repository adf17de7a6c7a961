//! Configuration for the log writer and commit log
//!
//! Loaded from a JSON file. Every field has a default, so `{}` is a valid
//! configuration. Values are checked by `validate()` before anything is
//! opened.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wal::{GroupCommitConfig, HEADER_LEN};

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Which commit-log backend records commit decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitLogBackend {
    /// Dedicated memory-mapped page log
    Mmap,
    /// Commit decisions are the XID records in the log files
    Wal,
}

/// Commit-log settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogConfig {
    #[serde(default = "default_backend")]
    pub backend: CommitLogBackend,

    /// Path of the mmap commit-log file
    #[serde(default = "default_tc_path")]
    pub path: PathBuf,

    /// Size of the mmap commit-log file in bytes
    #[serde(default = "default_tc_size")]
    pub size: u64,

    /// Page size of the mmap commit log; a multiple of the 8-byte slot size
    #[serde(default = "default_tc_page_size")]
    pub page_size: usize,
}

fn default_backend() -> CommitLogBackend {
    CommitLogBackend::Wal
}
fn default_tc_path() -> PathBuf {
    PathBuf::from("data/tc.log")
}
fn default_tc_size() -> u64 {
    6 * 4096
}
fn default_tc_page_size() -> usize {
    4096
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_tc_path(),
            size: default_tc_size(),
            page_size: default_tc_page_size(),
        }
    }
}

impl CommitLogConfig {
    /// Smallest number of pages the mmap log accepts
    pub const MIN_PAGES: u64 = 3;

    pub fn validate(&self) -> ConfigResult<()> {
        if self.page_size == 0 || self.page_size % 8 != 0 {
            return Err(invalid(
                "commit_log.page_size",
                format!("{} is not a positive multiple of 8", self.page_size),
            ));
        }
        if self.size % self.page_size as u64 != 0 {
            return Err(invalid(
                "commit_log.size",
                format!("{} is not a multiple of the page size {}", self.size, self.page_size),
            ));
        }
        if self.size / (self.page_size as u64) < Self::MIN_PAGES {
            return Err(invalid(
                "commit_log.size",
                format!("at least {} pages are required", Self::MIN_PAGES),
            ));
        }
        Ok(())
    }
}

/// Log writer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding log files, the index and the purge-intent file
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// File name stem; files are `<base_name>.NNNNNN`
    #[serde(default = "default_base_name")]
    pub base_name: String,

    /// Originating server id stamped on every record
    #[serde(default = "default_server_id")]
    pub server_id: u32,

    /// Rotate once the active file reaches this size
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Largest transaction cache a session may build
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,

    /// Chunk size used when copying a cache into the log
    #[serde(default = "default_cache_read_buffer")]
    pub cache_read_buffer: usize,

    /// fsync every Nth write; 0 leaves syncing to the OS
    #[serde(default = "default_sync_period")]
    pub sync_period: u64,

    /// Purge files older than this many days after rotation; 0 keeps everything
    #[serde(default)]
    pub expire_logs_days: u32,

    #[serde(default)]
    pub group_commit: GroupCommitConfig,

    #[serde(default)]
    pub commit_log: CommitLogConfig,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("data/binlog")
}
fn default_base_name() -> String {
    "aerolog-bin".to_string()
}
fn default_server_id() -> u32 {
    1
}
fn default_max_file_size() -> u64 {
    1 << 30
} // 1GB
fn default_max_cache_size() -> u64 {
    u32::MAX as u64
}
fn default_cache_read_buffer() -> usize {
    4096
}
fn default_sync_period() -> u64 {
    1
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            base_name: default_base_name(),
            server_id: default_server_id(),
            max_file_size: default_max_file_size(),
            max_cache_size: default_max_cache_size(),
            cache_read_buffer: default_cache_read_buffer(),
            sync_period: default_sync_period(),
            expire_logs_days: 0,
            group_commit: GroupCommitConfig::default(),
            commit_log: CommitLogConfig::default(),
        }
    }
}

impl LogConfig {
    /// Defaults rooted at `dir`: logs in `dir`, commit log at `dir/tc.log`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            log_dir: dir.to_path_buf(),
            commit_log: CommitLogConfig {
                path: dir.join("tc.log"),
                ..CommitLogConfig::default()
            },
            ..Self::default()
        }
    }

    /// Loads and validates a JSON configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: LogConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_name.is_empty() || self.base_name.contains(|c: char| c == '/' || c == '\\') {
            return Err(invalid(
                "base_name",
                format!("'{}' must be a non-empty file name", self.base_name),
            ));
        }
        if self.max_file_size < 4096 || self.max_file_size > u32::MAX as u64 {
            return Err(invalid(
                "max_file_size",
                format!("{} is outside 4096..=4294967295", self.max_file_size),
            ));
        }
        if self.cache_read_buffer < HEADER_LEN {
            return Err(invalid(
                "cache_read_buffer",
                format!("must hold a {}-byte record header", HEADER_LEN),
            ));
        }
        if self.max_cache_size == 0 {
            return Err(invalid("max_cache_size", "must be positive"));
        }
        self.group_commit.validate().map_err(|reason| invalid("group_commit", reason))?;
        self.commit_log.validate()
    }
}
