//! Lifecycle events of the commit path
//!
//! Every structured log line names one of these.

use std::fmt;

use super::logger::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Log writer
    LogOpen,
    LogRotate,
    LogClose,
    LogReset,
    /// An I/O failure moved the writer to its disabled state
    LogDisabled,
    LogReopened,
    LogPurge,
    /// A purge left behind by a crash was finished on open
    LogPurgeReplayed,
    /// A file could not be deleted during purge
    LogPurgeSkipped,

    // Group commit
    GroupCommitDisabled,
    GroupCommitLongWait,

    // Commit log
    TcOpen,
    TcClose,
    TcRecoveryBegin,
    TcRecoveryComplete,
    TcRecoveryFailed,
    TcPageSyncFailed,
    /// The newest log file was cut back to its last complete transaction
    TcLogTruncated,

    // Coordinator
    CommitFailed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::LogOpen => "LOG_OPEN",
            Event::LogRotate => "LOG_ROTATE",
            Event::LogClose => "LOG_CLOSE",
            Event::LogReset => "LOG_RESET",
            Event::LogDisabled => "LOG_DISABLED",
            Event::LogReopened => "LOG_REOPENED",
            Event::LogPurge => "LOG_PURGE",
            Event::LogPurgeReplayed => "LOG_PURGE_REPLAYED",
            Event::LogPurgeSkipped => "LOG_PURGE_SKIPPED",
            Event::GroupCommitDisabled => "GROUP_COMMIT_DISABLED",
            Event::GroupCommitLongWait => "GROUP_COMMIT_LONG_WAIT",
            Event::TcOpen => "TC_OPEN",
            Event::TcClose => "TC_CLOSE",
            Event::TcRecoveryBegin => "TC_RECOVERY_BEGIN",
            Event::TcRecoveryComplete => "TC_RECOVERY_COMPLETE",
            Event::TcRecoveryFailed => "TC_RECOVERY_FAILED",
            Event::TcPageSyncFailed => "TC_PAGE_SYNC_FAILED",
            Event::TcLogTruncated => "TC_LOG_TRUNCATED",
            Event::CommitFailed => "COMMIT_FAILED",
        }
    }

    /// Severity used when the event is logged without an explicit level
    pub fn default_severity(&self) -> Severity {
        match self {
            Event::LogDisabled | Event::TcRecoveryFailed => Severity::Fatal,
            Event::TcPageSyncFailed | Event::CommitFailed => Severity::Error,
            Event::GroupCommitDisabled
            | Event::GroupCommitLongWait
            | Event::LogPurgeSkipped
            | Event::TcLogTruncated
            | Event::LogPurgeReplayed => Severity::Warn,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
