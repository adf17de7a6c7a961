//! Write-ahead log for the commit path
//!
//! A session buffers its records in a [`TransactionCache`]. At commit the
//! [`LogWriter`] frames the cache with BEGIN and a COMMIT, ROLLBACK or XID
//! marker, appends it to the active file at its final offset, and asks the
//! [`GroupCommitCoordinator`] how to make it durable.
//!
//! Files are named `<base>.NNNNNN` and listed oldest first in
//! `<base>.index`. Each file starts with a 4-byte magic and a format record
//! whose in-use flag is set while the file is being written.
//!
//! # Module Layout
//!
//! - `record`: on-disk record format
//! - `cache`: per-session transaction cache
//! - `relocate`: copying a cache into a file with end-position fixup
//! - `index`: index file and purge intent
//! - `writer`: append, rotation, purge, fail-safe disable
//! - `group_commit`: commit tickets and fsync batching
//! - `reader` / `recovery`: sequential reads and the crash scan

mod cache;
mod checksum;
mod errors;
mod group_commit;
mod index;
mod reader;
mod record;
mod recovery;
mod relocate;
mod writer;

pub use cache::{RowBatch, TransactionCache};
pub use checksum::{record_checksum, verify_record_checksum};
pub use errors::{LogError, LogErrorCode, LogResult, Severity};
pub use group_commit::{GroupCommitConfig, GroupCommitCoordinator, SyncOutcome, Ticket};
pub use index::LogIndex;
pub use reader::LogReader;
pub use record::{
    DecodeError, IncidentKind, LogRecord, RecordBody, RecordHeader, RecordType, FLAG_IN_USE,
    HEADER_LEN, LOG_MAGIC,
};
pub use recovery::{release_after_crash, scan_log_file, LogScan};
pub use relocate::write_cache;
pub use writer::{LogConsumer, LogWriter, Marker, WriteReceipt, WriterStatus};
