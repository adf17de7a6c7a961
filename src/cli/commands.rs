//! CLI command implementations
//!
//! Each command loads the configuration, does its work and prints JSON
//! lines. Commands that open the log writer close it again before
//! returning, so the files are left cleanly shut down. They refuse to run
//! while a crashed log still holds commit decisions for the engines.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::write_line;
use crate::config::{CommitLogBackend, LogConfig};
use crate::observability::MetricsRegistry;
use crate::tc::{MmapCommitLog, WalBackedCommitLog};
use crate::wal::{LogIndex, LogReader, LogRecord, LogScan, LogWriter, RecordBody, FLAG_IN_USE};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_command(cli.command, &mut out)?;
    out.flush()?;
    Ok(())
}

/// Run the appropriate command based on CLI args
pub fn run_command<W: Write>(cmd: Command, out: &mut W) -> CliResult<()> {
    match cmd {
        Command::Inspect { config } => inspect(&config, out),
        Command::Dump { file } => dump(&file, out),
        Command::Recover { config } => recover(&config, out),
        Command::Purge { config, to, before } => {
            purge(&config, to.as_deref(), before.as_deref(), out)
        }
        Command::Rotate { config } => rotate(&config, out),
    }
}

/// Lists indexed files, scans the newest one and reads the mmap commit log.
///
/// Nothing is created or modified.
pub fn inspect<W: Write>(config_path: &Path, out: &mut W) -> CliResult<()> {
    let config = LogConfig::load(config_path)?;

    match LogIndex::read_existing(&config.log_dir, &config.base_name)? {
        Some(index) => {
            for name in index.entries() {
                let size = fs::metadata(index.file_path(name)).map(|m| m.len()).ok();
                write_line(out, &json!({"file": name, "size": size}))?;
            }
        }
        None => write_line(out, &json!({"index": Value::Null}))?,
    }

    if let Some(scan) = WalBackedCommitLog::inspect(&config)? {
        write_line(out, &scan_json(&scan))?;
    }

    let tc_path = &config.commit_log.path;
    if config.commit_log.backend == CommitLogBackend::Mmap && tc_path.exists() {
        let view = MmapCommitLog::inspect(tc_path, config.commit_log.page_size)?;
        write_line(
            out,
            &json!({
                "commit_log": view.path.display().to_string(),
                "engines": view.engines,
                "pages": view.pages,
                "xids": view.xids,
            }),
        )?;
    }
    Ok(())
}

/// Prints every record of `file` with its absolute position
pub fn dump<W: Write>(file: &Path, out: &mut W) -> CliResult<()> {
    let mut reader = LogReader::open(file)?;
    let format = reader.format_record().clone();
    let format_start = (format.header.end_pos - format.header.record_len) as u64;
    write_line(out, &record_json(format_start, &format))?;

    for (pos, record) in reader.read_all()? {
        write_line(out, &record_json(pos, &record))?;
    }
    Ok(())
}

/// Reports whether the commit log crashed and which xids it holds as
/// committed.
///
/// Nothing is modified. Resolving the prepared transactions needs the
/// engines, so the crash state is left for the server to recover: opening
/// a writer here would release the newest log file, and wiping the mmap
/// file would lose the decisions.
pub fn recover<W: Write>(config_path: &Path, out: &mut W) -> CliResult<()> {
    let config = LogConfig::load(config_path)?;

    match config.commit_log.backend {
        CommitLogBackend::Wal => {
            let scan = WalBackedCommitLog::inspect(&config)?;
            let crashed = scan.as_ref().map_or(false, |s| s.in_use);
            let committed = scan
                .filter(|s| s.in_use)
                .map(|s| s.committed)
                .unwrap_or_default();
            write_line(
                out,
                &json!({"backend": "wal", "crashed": crashed, "committed": committed}),
            )
        }
        CommitLogBackend::Mmap => {
            let path = &config.commit_log.path;
            if !path.exists() {
                return write_line(
                    out,
                    &json!({"backend": "mmap", "crashed": false, "committed": []}),
                );
            }
            let view = MmapCommitLog::inspect(path, config.commit_log.page_size)?;
            write_line(
                out,
                &json!({
                    "backend": "mmap",
                    "crashed": true,
                    "engines": view.engines,
                    "committed": view.xids,
                }),
            )
        }
    }
}

/// Purges files before `to`, or files last modified before `before`.
///
/// A purge interrupted by a crash is finished when the writer opens.
pub fn purge<W: Write>(
    config_path: &Path,
    to: Option<&str>,
    before: Option<&str>,
    out: &mut W,
) -> CliResult<()> {
    let cutoff = match (to, before) {
        (Some(_), None) => None,
        (None, Some(text)) => Some(parse_time(text)?),
        _ => {
            return Err(CliError::invalid_argument(
                "exactly one of --to and --before is required",
            ))
        }
    };

    let writer = open_writer(config_path)?;
    let purged = match (to, cutoff) {
        (Some(name), _) => writer.purge_before(name),
        (None, Some(cutoff)) => writer.purge_older_than(cutoff),
        (None, None) => Ok(Vec::new()),
    };
    let closed = writer.close();
    let purged = purged?;
    closed?;
    write_line(out, &json!({"purged": purged}))
}

/// Rotates to a new active file
pub fn rotate<W: Write>(config_path: &Path, out: &mut W) -> CliResult<()> {
    let writer = open_writer(config_path)?;
    let rotated = writer.rotate();
    let active = writer.active_file();
    let closed = writer.close();
    rotated?;
    closed?;
    write_line(out, &json!({"active": active}))
}

/// Opens the writer unless that would release commit decisions.
///
/// With the log-file backend, a crashed newest file holding XID records is
/// the only record of those commits until the engines have recovered them.
fn open_writer(config_path: &Path) -> CliResult<LogWriter> {
    let config = LogConfig::load(config_path)?;
    if config.commit_log.backend == CommitLogBackend::Wal {
        if let Some(scan) = WalBackedCommitLog::inspect(&config)? {
            if scan.in_use && !scan.committed.is_empty() {
                return Err(CliError::unresolved_crash(format!(
                    "{} holds {} unrecovered commit decisions; open the commit log with its engines first",
                    scan.path.display(),
                    scan.committed.len()
                )));
            }
        }
    }
    Ok(LogWriter::open(config, Arc::new(MetricsRegistry::new()))?)
}

fn parse_time(text: &str) -> CliResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CliError::invalid_argument(format!("--before '{}': {}", text, e)))
}

fn scan_json(scan: &LogScan) -> Value {
    json!({
        "newest": scan.path.display().to_string(),
        "in_use": scan.in_use,
        "committed": scan.committed,
        "valid_pos": scan.valid_pos,
        "file_len": scan.file_len,
        "open_transaction": scan.open_transaction,
        "stop_reason": scan.stop_reason,
    })
}

fn record_json(pos: u64, record: &LogRecord) -> Value {
    let header = &record.header;
    let body = match &record.body {
        RecordBody::FormatDescription {
            version,
            server_version,
            created,
        } => json!({
            "version": version,
            "server_version": server_version,
            "created": created,
            "in_use": header.flags & FLAG_IN_USE != 0,
        }),
        RecordBody::Query(query) => json!({"query": query}),
        RecordBody::Xid(xid) => json!({"xid": xid}),
        RecordBody::Rotate {
            next_file,
            position,
        } => json!({"next_file": next_file, "position": position}),
        RecordBody::Incident { kind, message } => {
            json!({"incident": format!("{:?}", kind), "message": message})
        }
        RecordBody::Rows {
            table_id,
            row_count,
            payload,
        } => json!({"table_id": table_id, "row_count": row_count, "payload_len": payload.len()}),
        RecordBody::Stop => json!({}),
    };
    json!({
        "pos": pos,
        "end_pos": header.end_pos,
        "type": format!("{:?}", header.record_type),
        "server_id": header.server_id,
        "timestamp": header.timestamp,
        "body": body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::tc::{
        CommitLog, EngineError, EngineSet, RecoveredTxn, Resolution, StorageEngine, Xid,
    };
    use crate::wal::Marker;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    /// Engine whose prepared xids wait for recovery
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

    /// Logs xid 42 and drops the commit log without closing it
    fn crash_after_log_xid(config: &LogConfig) {
        let (log, _) = WalBackedCommitLog::open(
            config,
            &EngineSet::default(),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let mut session = Session::new(config);
        session.log_statement("INSERT INTO t VALUES (42)").unwrap();
        session.commit_statement();
        log.log_xid(&mut session, 42).unwrap();
    }

    fn write_config(dir: &Path, backend: &str) -> std::path::PathBuf {
        let path = dir.join("aerolog.json");
        let config = json!({
            "log_dir": dir.join("logs"),
            "commit_log": {"backend": backend, "path": dir.join("tc.log")},
        });
        fs::write(&path, config.to_string()).unwrap();
        path
    }

    fn lines(out: Vec<u8>) -> Vec<Value> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_inspect_without_logs() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "wal");
        let mut out = Vec::new();
        inspect(&config, &mut out).unwrap();
        assert_eq!(lines(out), vec![json!({"index": null})]);
        assert!(!tmp.path().join("logs").exists());
    }

    #[test]
    fn test_rotate_then_inspect() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "wal");

        let mut out = Vec::new();
        rotate(&config, &mut out).unwrap();
        assert_eq!(lines(out), vec![json!({"active": "aerolog-bin.000002"})]);

        let mut out = Vec::new();
        inspect(&config, &mut out).unwrap();
        let out = lines(out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["file"], "aerolog-bin.000001");
        assert_eq!(out[1]["file"], "aerolog-bin.000002");
        assert_eq!(out[2]["in_use"], false);
    }

    #[test]
    fn test_dump_prints_positions() {
        let tmp = TempDir::new().unwrap();
        let config_path = write_config(tmp.path(), "wal");
        let config = LogConfig::load(&config_path).unwrap();
        let writer = LogWriter::open(config.clone(), Arc::new(MetricsRegistry::new())).unwrap();
        let mut session = Session::new(&config);
        session.log_statement("INSERT INTO t VALUES (1)").unwrap();
        session.commit_statement();
        writer.write(session.cache_mut(), Marker::Commit, false, false).unwrap();
        let file = writer.file_path("aerolog-bin.000001");
        writer.close().unwrap();

        let mut out = Vec::new();
        dump(&file, &mut out).unwrap();
        let out = lines(out);
        assert_eq!(out[0]["type"], "FormatDescription");
        assert_eq!(out[0]["pos"], 4);
        assert_eq!(out[0]["body"]["in_use"], false);
        let queries: Vec<&Value> = out.iter().map(|r| &r["body"]["query"]).collect();
        assert_eq!(queries[1], "BEGIN");
        assert_eq!(queries[2], "INSERT INTO t VALUES (1)");
        assert_eq!(queries[3], "COMMIT");
        assert_eq!(out.last().unwrap()["type"], "Stop");
        for pair in out.windows(2) {
            assert_eq!(pair[0]["end_pos"], pair[1]["pos"]);
        }
    }

    #[test]
    fn test_purge_to() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "wal");
        for _ in 0..2 {
            rotate(&config, &mut Vec::new()).unwrap();
        }

        let mut out = Vec::new();
        purge(&config, Some("aerolog-bin.000003"), None, &mut out).unwrap();
        assert_eq!(
            lines(out),
            vec![json!({"purged": ["aerolog-bin.000001", "aerolog-bin.000002"]})]
        );
        assert!(!tmp.path().join("logs").join("aerolog-bin.000001").exists());
    }

    #[test]
    fn test_purge_rejects_bad_time() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "wal");
        let err = purge(&config, None, Some("yesterday"), &mut Vec::new()).unwrap_err();
        assert_eq!(err.code_str(), "AERO_CLI_INVALID_ARGUMENT");
        assert!(!tmp.path().join("logs").exists());
    }

    #[test]
    fn test_recover_clean_logs() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "wal");
        let mut out = Vec::new();
        recover(&config, &mut out).unwrap();
        assert_eq!(
            lines(out),
            vec![json!({"backend": "wal", "crashed": false, "committed": []})]
        );

        let config = write_config(tmp.path(), "mmap");
        let mut out = Vec::new();
        recover(&config, &mut out).unwrap();
        assert_eq!(
            lines(out),
            vec![json!({"backend": "mmap", "crashed": false, "committed": []})]
        );
    }

    // =========================================================================
    // Crashed Log Tests
    // =========================================================================

    #[test]
    fn test_recover_leaves_crash_for_engines() {
        let tmp = TempDir::new().unwrap();
        let config_path = write_config(tmp.path(), "wal");
        let config = LogConfig::load(&config_path).unwrap();
        crash_after_log_xid(&config);

        for _ in 0..2 {
            let mut out = Vec::new();
            recover(&config_path, &mut out).unwrap();
            assert_eq!(
                lines(out),
                vec![json!({"backend": "wal", "crashed": true, "committed": [42]})]
            );
        }

        let engine = Arc::new(PreparedEngine::default());
        engine.prepare(42).unwrap();
        let (log, report) = WalBackedCommitLog::open(
            &config,
            &EngineSet::new(vec![engine.clone()]),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let report = report.expect("crash still pending after cli recover");
        assert_eq!(report.committed, [42].into_iter().collect());
        assert_eq!(report.engines[0].committed, vec![42]);
        assert!(engine.prepared.lock().is_empty());
        log.close().unwrap();
    }

    #[test]
    fn test_writer_commands_refuse_unrecovered_log() {
        let tmp = TempDir::new().unwrap();
        let config_path = write_config(tmp.path(), "wal");
        let config = LogConfig::load(&config_path).unwrap();
        crash_after_log_xid(&config);

        let err = rotate(&config_path, &mut Vec::new()).unwrap_err();
        assert_eq!(err.code_str(), "AERO_CLI_UNRESOLVED_CRASH");
        let err = purge(&config_path, Some("aerolog-bin.000001"), None, &mut Vec::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "AERO_CLI_UNRESOLVED_CRASH");
        assert_eq!(
            WalBackedCommitLog::inspect(&config).unwrap().unwrap().committed,
            [42].into_iter().collect()
        );

        let (log, _) = WalBackedCommitLog::open(
            &config,
            &EngineSet::default(),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        log.close().unwrap();
        rotate(&config_path, &mut Vec::new()).unwrap();
    }

    #[test]
    fn test_missing_config() {
        let tmp = TempDir::new().unwrap();
        let err = inspect(&tmp.path().join("none.json"), &mut Vec::new()).unwrap_err();
        assert_eq!(err.code_str(), "AERO_CLI_CONFIG_ERROR");
    }
}
