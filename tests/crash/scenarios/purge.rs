//! Crash scenarios for purge
//!
//! A purge writes its intent file, unlinks files, then rewrites the index.
//! A crash anywhere in between must leave a state from which the next
//! writer open deletes exactly the files the purge chose.

use std::path::PathBuf;

use aerolog::config::LogConfig;
use aerolog::crash_point::points;
use tempfile::TempDir;

use crate::crash::{
    index_entries, load_config, purge_intent_exists, reopen, run_clean, run_crashing,
    validate_released_files, write_config,
};

struct Setup {
    _tmp: TempDir,
    config_path: PathBuf,
    config: LogConfig,
    names: Vec<String>,
}

/// Four closed files: two `rotate` runs each open a file and rotate once
fn setup() -> Setup {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path());
    run_clean(&["rotate"], &config_path);
    run_clean(&["rotate"], &config_path);
    let config = load_config(&config_path);
    let names = index_entries(&config);
    assert_eq!(names.len(), 4);
    Setup {
        _tmp: tmp,
        config_path,
        config,
        names,
    }
}

fn purge_crash_is_finished_on_reopen(point: &str) {
    let s = setup();
    run_crashing(&["purge", "--to", &s.names[2]], &s.config_path, point);
    assert!(purge_intent_exists(&s.config));

    let writer = reopen(&s.config);
    assert!(!s.config.log_dir.join(&s.names[0]).exists());
    assert!(!s.config.log_dir.join(&s.names[1]).exists());
    assert!(s.config.log_dir.join(&s.names[2]).exists());
    assert!(s.config.log_dir.join(&s.names[3]).exists());
    assert_eq!(writer.index_entries()[..2], s.names[2..]);
    assert!(!purge_intent_exists(&s.config));
    writer.close().unwrap();

    validate_released_files(&s.config).unwrap();
}

#[test]
fn test_crash_after_purge_intent() {
    purge_crash_is_finished_on_reopen(points::LOG_AFTER_PURGE_INTENT);
}

#[test]
fn test_crash_after_first_unlink() {
    purge_crash_is_finished_on_reopen(points::LOG_AFTER_UNLINK);
}

#[test]
fn test_crash_before_index_rewrite() {
    purge_crash_is_finished_on_reopen(points::LOG_BEFORE_INDEX_REWRITE);
}

#[test]
fn test_clean_purge_via_cli() {
    let s = setup();
    let out = run_clean(&["purge", "--to", &s.names[2]], &s.config_path);
    let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(line["purged"], serde_json::json!(s.names[..2]));
    assert!(!purge_intent_exists(&s.config));
    validate_released_files(&s.config).unwrap();
}
