//! Transaction coordinator log
//!
//! A commit log durably records the decision to commit a two-phase
//! transaction between "all engines prepared" and "engines commit". After
//! a crash it is the only authority on which prepared transactions were
//! committed.
//!
//! Two backends implement [`CommitLog`]:
//!
//! - [`MmapCommitLog`]: a dedicated memory-mapped file of xid slots, used
//!   when no log writer is running
//! - [`WalBackedCommitLog`]: the XID records in the log files, written
//!   together with the transaction itself
//!
//! The commit sequence is driven by [`TransactionCoordinator`].

mod coordinator;
mod engine;
mod errors;
mod mmap;
mod page;
mod wal_backed;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{CommitLogBackend, LogConfig};
use crate::observability::MetricsRegistry;
use crate::session::Session;
use crate::wal::GroupCommitCoordinator;

pub use coordinator::TransactionCoordinator;
pub use engine::{
    EngineError, EngineRecovery, EngineSet, RecoveredTxn, RecoveryReport, Resolution,
    StorageEngine,
};
pub use errors::{TcError, TcErrorCode, TcResult};
pub use mmap::{MmapCommitLog, MmapInspection, TC_MAGIC};
pub use page::{choose_pool_page, transition, waiter_decision, PageCtl, PageEvent, PageState, WaitDecision};
pub use wal_backed::WalBackedCommitLog;

/// Transaction id; zero never names a transaction
pub type Xid = u64;

/// Handle returned by `log_xid`, passed back to `unlog`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cookie {
    /// Slot of the mmap log holding the xid
    Slot { page: usize, slot: usize },
    /// The xid was written to the log files; `log_full` asks for a rotation
    /// once the xid is unlogged
    Logged { log_full: bool },
}

/// Durable record of commit decisions
pub trait CommitLog: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes the commit decision for `xid` durable.
    ///
    /// Returns only once the decision survives a crash.
    fn log_xid(&self, session: &mut Session, xid: Xid) -> TcResult<Cookie>;

    /// Forgets `xid` once every engine has committed it
    fn unlog(&self, cookie: Cookie, xid: Xid) -> TcResult<()>;

    /// Xids the log holds as committed.
    ///
    /// The mmap log forgets an xid at `unlog`. The log-file backend keeps
    /// every XID record of the newest file, unlogged or not.
    fn recover(&self) -> TcResult<BTreeSet<Xid>>;

    fn close(&self) -> TcResult<()>;

    /// Commit-order coordinator, for logs that issue tickets
    fn group_commit(&self) -> Option<&GroupCommitCoordinator> {
        None
    }
}

/// Opens the configured backend, resolving prepared transactions left by a
/// crash before returning.
///
/// The report is `None` when the previous process shut down cleanly.
pub fn open_commit_log(
    config: &LogConfig,
    engines: &EngineSet,
    metrics: Arc<MetricsRegistry>,
) -> TcResult<(Arc<dyn CommitLog>, Option<RecoveryReport>)> {
    match config.commit_log.backend {
        CommitLogBackend::Mmap => {
            let (log, report) = MmapCommitLog::open(&config.commit_log, engines, metrics)?;
            Ok((Arc::new(log), report))
        }
        CommitLogBackend::Wal => {
            let (log, report) = WalBackedCommitLog::open(config, engines, metrics)?;
            Ok((Arc::new(log), report))
        }
    }
}
