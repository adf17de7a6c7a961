//! Crash scenarios for rotation

use aerolog::crash_point::points;
use tempfile::TempDir;

use crate::crash::{
    index_entries, load_config, reopen, run_clean, run_crashing, validate_released_files,
    write_config,
};

/// The rotate record reached the old file but the next file was never
/// created. Reopening releases the old file and carries on after it.
#[test]
fn test_crash_after_rotate_marker() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path());
    run_crashing(&["rotate"], &config_path, points::LOG_AFTER_ROTATE_MARKER);

    let config = load_config(&config_path);
    assert_eq!(index_entries(&config), vec!["aerolog-bin.000001"]);

    let out = run_clean(&["recover"], &config_path);
    let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(line["crashed"], true);
    assert_eq!(line["committed"], serde_json::json!([]));

    let writer = reopen(&config);
    assert_eq!(writer.index_entries()[0], "aerolog-bin.000001");
    writer.close().unwrap();
    validate_released_files(&config).unwrap();
}
