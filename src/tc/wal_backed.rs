//! Commit log carried by the log files
//!
//! The XID record that ends a transaction in the log is the commit
//! decision. Writing the transaction through [`LogWriter::write`] and
//! syncing it makes the decision durable, so `unlog` only has to release
//! the prepared count that holds back rotation.
//!
//! After a crash the newest log file still carries its in-use flag. Its
//! XID records are the committed set handed to the engines; the file is
//! then cut back to its last complete transaction when the writer opens.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::LogConfig;
use crate::observability::{log_event, Event, MetricsRegistry};
use crate::session::Session;
use crate::wal::{
    scan_log_file, GroupCommitCoordinator, LogIndex, LogScan, LogWriter, Marker,
};

use super::engine::{EngineSet, RecoveryReport};
use super::errors::{TcError, TcResult};
use super::{CommitLog, Cookie, Xid};

/// Commit log whose decisions are XID records in the log files
pub struct WalBackedCommitLog {
    writer: Arc<LogWriter>,
    closed: AtomicBool,
}

impl WalBackedCommitLog {
    /// Recovers from an unclean shutdown if needed, then opens the writer.
    ///
    /// # Errors
    ///
    /// - `AERO_TC_RECOVERY_FAILED` if an engine cannot resolve its xids
    /// - `AERO_TC_LOG` if the newest file cannot be scanned or the writer
    ///   cannot open
    pub fn open(
        config: &LogConfig,
        engines: &EngineSet,
        metrics: Arc<MetricsRegistry>,
    ) -> TcResult<(Self, Option<RecoveryReport>)> {
        let report = match newest_file(config)? {
            Some(path) => {
                let scan = scan_log_file(&path)?;
                if scan.in_use {
                    Some(recover_scan(&scan, engines, &metrics)?)
                } else {
                    None
                }
            }
            None => None,
        };

        let writer = LogWriter::open(config.clone(), metrics)?;
        log_event(
            Event::TcOpen,
            &[
                ("backend", "wal"),
                ("dir", &config.log_dir.display().to_string()),
            ],
        );
        Ok((Self::with_writer(Arc::new(writer)), report))
    }

    /// Uses an already open writer, skipping recovery
    pub fn with_writer(writer: Arc<LogWriter>) -> Self {
        Self {
            writer,
            closed: AtomicBool::new(false),
        }
    }

    pub fn writer(&self) -> &Arc<LogWriter> {
        &self.writer
    }

    /// Scans the newest indexed file without changing anything.
    ///
    /// Returns `None` if no log file exists yet.
    pub fn inspect(config: &LogConfig) -> TcResult<Option<LogScan>> {
        match newest_file(config)? {
            Some(path) => Ok(Some(scan_log_file(&path)?)),
            None => Ok(None),
        }
    }

    fn check_open(&self) -> TcResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TcError::closed());
        }
        Ok(())
    }
}

/// Path of the last file named in the index, if it exists.
///
/// Uses [`LogIndex::read_existing`] so inspection never creates anything.
fn newest_file(config: &LogConfig) -> TcResult<Option<PathBuf>> {
    let index = match LogIndex::read_existing(&config.log_dir, &config.base_name)? {
        Some(index) => index,
        None => return Ok(None),
    };
    Ok(index
        .last()
        .map(|name| index.file_path(name))
        .filter(|path| path.exists()))
}

fn recover_scan(
    scan: &LogScan,
    engines: &EngineSet,
    metrics: &MetricsRegistry,
) -> TcResult<RecoveryReport> {
    let path = scan.path.display().to_string();
    log_event(Event::TcRecoveryBegin, &[("backend", "wal"), ("path", &path)]);

    match engines.recover(&scan.committed) {
        Ok(report) => {
            metrics.add_recovered_xids(report.resolved().len() as u64);
            log_event(
                Event::TcRecoveryComplete,
                &[
                    ("backend", "wal"),
                    ("committed", &report.committed.len().to_string()),
                    ("resolved", &report.resolved().len().to_string()),
                    ("open_transaction", &scan.open_transaction.to_string()),
                ],
            );
            Ok(report)
        }
        Err(e) => {
            log_event(
                Event::TcRecoveryFailed,
                &[("path", &path), ("error", &e.to_string())],
            );
            Err(TcError::recovery_failed(e.to_string()))
        }
    }
}

impl CommitLog for WalBackedCommitLog {
    fn name(&self) -> &'static str {
        "wal"
    }

    /// Writes the session's transaction ended by an XID record.
    ///
    /// The session receives the commit ticket, if one was issued.
    fn log_xid(&self, session: &mut Session, xid: Xid) -> TcResult<Cookie> {
        self.check_open()?;
        if session.ticket().is_some() {
            // A ticket that was never advanced would stall every later commit.
            self.writer
                .group_commit()
                .disable("session already holds an unadvanced commit ticket");
            session.set_ticket(None);
        }

        let ordering_required = session.ordering_required();
        let result = self
            .writer
            .write(session.cache_mut(), Marker::Xid(xid), false, ordering_required);
        session.clear_savepoints();
        let receipt = result?;

        let log_full = receipt.log_full;
        session.set_ticket(receipt.ticket);
        Ok(Cookie::Logged { log_full })
    }

    /// Releases the prepared xid, then rotates if its write filled the file
    fn unlog(&self, cookie: Cookie, _xid: Xid) -> TcResult<()> {
        let log_full = match cookie {
            Cookie::Logged { log_full } => log_full,
            Cookie::Slot { .. } => {
                return Err(TcError::invalid_cookie(
                    "cookie was not issued by the log-backed commit log",
                ))
            }
        };
        self.writer.release_prepared();
        if log_full {
            self.writer.rotate_and_purge(false)?;
        }
        Ok(())
    }

    /// Xids with an XID record in the newest log file
    fn recover(&self) -> TcResult<BTreeSet<Xid>> {
        self.check_open()?;
        match self.writer.active_file() {
            Some(name) => Ok(scan_log_file(&self.writer.file_path(&name))?.committed),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Waits for every prepared xid to be unlogged, then closes the writer
    fn close(&self) -> TcResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer.wait_for_prepared();
        self.writer.close()?;
        log_event(Event::TcClose, &[("backend", "wal")]);
        Ok(())
    }

    fn group_commit(&self) -> Option<&GroupCommitCoordinator> {
        Some(self.writer.group_commit())
    }
}
