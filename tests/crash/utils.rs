//! Crash testing utilities

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aerolog::config::LogConfig;
use aerolog::observability::MetricsRegistry;
use aerolog::wal::{LogIndex, LogReader, LogWriter};

/// Writes a config rooted at `dir` and returns its path
pub fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("aerolog.json");
    let config = serde_json::json!({
        "log_dir": dir.join("logs"),
        "commit_log": {"path": dir.join("tc.log")},
    });
    fs::write(&path, config.to_string()).expect("Failed to write config");
    path
}

pub fn load_config(config: &Path) -> LogConfig {
    LogConfig::load(config).expect("Failed to load config")
}

/// Index entries as stored on disk, without creating anything
pub fn index_entries(config: &LogConfig) -> Vec<String> {
    LogIndex::read_existing(&config.log_dir, &config.base_name)
        .expect("Failed to read index")
        .map(|index| index.entries().to_vec())
        .unwrap_or_default()
}

pub fn purge_intent_exists(config: &LogConfig) -> bool {
    config
        .log_dir
        .join(format!("{}.~rec~", config.base_name))
        .exists()
}

/// Opens the writer, which replays interrupted purges and releases a
/// crashed file
pub fn reopen(config: &LogConfig) -> LogWriter {
    LogWriter::open(config.clone(), Arc::new(MetricsRegistry::new()))
        .expect("Failed to reopen after crash")
}

/// Every indexed file that exists reads cleanly to its end and is not in use
pub fn validate_released_files(config: &LogConfig) -> Result<(), String> {
    for name in index_entries(config) {
        let path = config.log_dir.join(&name);
        if !path.exists() {
            continue;
        }
        let mut reader = LogReader::open(&path).map_err(|e| format!("{}: {}", name, e))?;
        reader.read_all().map_err(|e| format!("{}: {}", name, e))?;
        if reader.is_in_use() {
            return Err(format!("{} is still marked in use", name));
        }
    }
    Ok(())
}
