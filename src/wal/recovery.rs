//! Crash scan of the newest log file
//!
//! A file whose format record still carries the in-use flag was not closed
//! cleanly. Scanning it forward tells which transactions reached their
//! commit marker:
//!
//! - an XID record commits the two-phase transaction it names
//! - a BEGIN without a closing COMMIT, ROLLBACK or XID before the end of the
//!   file (or before the first damaged record) is incomplete
//!
//! The valid prefix ends at the last record boundary outside a transaction.
//! Everything past it is cut off before the file is released.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::errors::{LogError, LogResult};
use super::reader::LogReader;
use super::record::{RecordBody, FLAG_IN_USE, IN_USE_FLAG_POSITION};

/// Result of scanning one log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogScan {
    pub path: PathBuf,
    /// The file was still marked in use by its writer
    pub in_use: bool,
    /// Xids with a well-formed commit marker
    pub committed: BTreeSet<u64>,
    /// End of the last complete record outside any transaction
    pub valid_pos: u64,
    pub file_len: u64,
    /// A BEGIN was still open when the scan stopped
    pub open_transaction: bool,
    /// Why the scan stopped before the end of the file, if it did
    pub stop_reason: Option<String>,
}

impl LogScan {
    /// True if recovery has bytes to cut off
    pub fn needs_truncation(&self) -> bool {
        self.valid_pos < self.file_len
    }
}

/// Scans `path` without modifying it.
///
/// # Errors
///
/// Returns `AERO_LOG_CORRUPTION` if the file has no valid magic or format
/// record. Damage after the format record only ends the scan.
pub fn scan_log_file(path: &Path) -> LogResult<LogScan> {
    let mut reader = LogReader::open(path)?;
    let mut scan = LogScan {
        path: path.to_path_buf(),
        in_use: reader.is_in_use(),
        committed: BTreeSet::new(),
        valid_pos: reader.offset(),
        file_len: reader.file_size(),
        open_transaction: false,
        stop_reason: None,
    };

    let mut in_transaction = false;
    loop {
        match reader.read_next() {
            Ok(Some(record)) => {
                match record.body {
                    RecordBody::Query(_) if record.body.is_begin() => in_transaction = true,
                    RecordBody::Query(_) if record.body.is_commit() || record.body.is_rollback() => {
                        in_transaction = false;
                    }
                    RecordBody::Xid(xid) => {
                        scan.committed.insert(xid);
                        in_transaction = false;
                    }
                    _ => {}
                }
                if !in_transaction {
                    scan.valid_pos = reader.offset();
                }
            }
            Ok(None) => break,
            Err(e) => {
                scan.stop_reason = Some(e.to_string());
                break;
            }
        }
    }
    scan.open_transaction = in_transaction;
    Ok(scan)
}

/// Cuts the file back to its valid prefix and clears the in-use flag.
pub fn release_after_crash(scan: &LogScan) -> LogResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(&scan.path)
        .map_err(|e| {
            LogError::write_failed(format!("Failed to open {} for recovery", scan.path.display()), e)
        })?;
    if scan.needs_truncation() {
        file.set_len(scan.valid_pos).map_err(|e| {
            LogError::write_failed(format!("Failed to truncate {}", scan.path.display()), e)
        })?;
    }
    set_in_use_flag(&mut file, false)?;
    file.sync_all().map_err(|e| {
        LogError::fsync_failed(format!("Failed to sync {}", scan.path.display()), e)
    })
}

/// Rewrites the format record's flags in place.
///
/// The flags sit in the header, outside the checksummed body, so they can
/// be flipped without re-encoding the record. The file cursor is left
/// wherever the write ended.
pub(crate) fn set_in_use_flag(file: &mut File, in_use: bool) -> LogResult<()> {
    let flags: u16 = if in_use { FLAG_IN_USE } else { 0 };
    file.seek(SeekFrom::Start(IN_USE_FLAG_POSITION))
        .and_then(|_| file.write_all(&flags.to_le_bytes()))
        .map_err(|e| LogError::write_failed("Failed to update log in-use flag", e))
}
