//! Crash scenarios for commit decisions left in the newest log file
//!
//! The operator commands run against the log after a crash. None of them
//! may release the newest file while its XID records are the only record
//! of commits the engines still hold prepared.

use std::collections::BTreeSet;
use std::sync::Arc;

use aerolog::config::LogConfig;
use aerolog::observability::MetricsRegistry;
use aerolog::session::Session;
use aerolog::tc::{
    CommitLog, EngineError, EngineSet, RecoveredTxn, Resolution, StorageEngine,
    WalBackedCommitLog, Xid,
};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::crash::{
    index_entries, load_config, run_aerolog, run_clean, validate_released_files, write_config,
};

/// Engine holding prepared xids until recovery decides them
#[derive(Default)]
struct PreparedEngine {
    prepared: Mutex<BTreeSet<Xid>>,
}

impl StorageEngine for PreparedEngine {
    fn name(&self) -> &str {
        "prepared"
    }
    fn prepare(&self, xid: Xid) -> Result<(), EngineError> {
        self.prepared.lock().insert(xid);
        Ok(())
    }
    fn commit(&self, xid: Xid) -> Result<(), EngineError> {
        self.prepared.lock().remove(&xid);
        Ok(())
    }
    fn rollback(&self, xid: Xid) -> Result<(), EngineError> {
        self.prepared.lock().remove(&xid);
        Ok(())
    }
    fn recover(&self, committed: &BTreeSet<Xid>) -> Result<Vec<RecoveredTxn>, EngineError> {
        let prepared = std::mem::take(&mut *self.prepared.lock());
        Ok(prepared
            .into_iter()
            .map(|xid| RecoveredTxn {
                xid,
                resolution: if committed.contains(&xid) {
                    Resolution::Committed
                } else {
                    Resolution::RolledBack
                },
            })
            .collect())
    }
}

/// Commits 42 and 43 to the log, then dies before the engines commit
fn crash_after_log_xid(config: &LogConfig) {
    let (log, _) = WalBackedCommitLog::open(
        config,
        &EngineSet::default(),
        Arc::new(MetricsRegistry::new()),
    )
    .expect("Failed to open commit log");
    for xid in [42, 43] {
        let mut session = Session::new(config);
        session
            .log_statement(&format!("INSERT INTO t VALUES ({})", xid))
            .unwrap();
        session.commit_statement();
        log.log_xid(&mut session, xid).unwrap();
    }
    // Crash: dropped without close.
}

#[test]
fn test_cli_after_crash_keeps_commit_decisions() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path());
    let config = load_config(&config_path);
    crash_after_log_xid(&config);
    let files = index_entries(&config);

    let out = run_clean(&["recover"], &config_path);
    let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(line["crashed"], true);
    assert_eq!(line["committed"], serde_json::json!([42, 43]));

    for args in [&["rotate"][..], &["purge", "--to", files[0].as_str()][..]] {
        let result = run_aerolog(args, &config_path, None);
        assert!(result.crashed, "aerolog {:?} ran on an unrecovered log", args);
        assert!(
            result.stderr.contains("AERO_CLI_UNRESOLVED_CRASH"),
            "unexpected stderr: {}",
            result.stderr
        );
    }
    assert_eq!(index_entries(&config), files);

    let engine = Arc::new(PreparedEngine::default());
    for xid in [42, 43, 44] {
        engine.prepare(xid).unwrap();
    }
    let (log, report) = WalBackedCommitLog::open(
        &config,
        &EngineSet::new(vec![engine.clone()]),
        Arc::new(MetricsRegistry::new()),
    )
    .unwrap();
    let report = report.expect("crash still pending after the cli ran");
    assert_eq!(report.engines[0].committed, vec![42, 43]);
    assert_eq!(report.engines[0].rolled_back, vec![44]);
    assert!(engine.prepared.lock().is_empty());
    log.close().unwrap();

    validate_released_files(&config).unwrap();
    let out = run_clean(&["recover"], &config_path);
    let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(line["crashed"], false);
}
