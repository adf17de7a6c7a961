//! Commit-log error types
//!
//! Error codes:
//! - AERO_TC_BAD_MAGIC (FATAL severity, refuses to start)
//! - AERO_TC_ENGINE_MISMATCH (FATAL severity, refuses to start)
//! - AERO_TC_CORRUPTION (FATAL severity)
//! - AERO_TC_RECOVERY_FAILED (FATAL severity)
//! - AERO_TC_SYNC_FAILED (ERROR severity, fails the commits on one page)
//! - AERO_TC_IO (ERROR severity)
//! - AERO_TC_INVALID_COOKIE (ERROR severity)
//! - AERO_TC_LOG (ERROR severity, wraps a log writer error)
//! - AERO_TC_ENGINE (ERROR severity)
//! - AERO_TC_INVALID_CONFIG (ERROR severity)
//! - AERO_TC_CLOSED (ERROR severity)

use std::fmt;
use std::io;

use crate::wal::{LogError, LogErrorCode, Severity};

use super::engine::EngineError;

/// Commit-log error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcErrorCode {
    /// The commit-log file does not start with the expected magic
    AeroTcBadMagic,
    /// The file was created for a different number of engines
    AeroTcEngineMismatch,
    /// Syncing a page of the mapped file failed
    AeroTcSyncFailed,
    /// Opening, sizing or mapping the file failed
    AeroTcIo,
    /// A slot or page holds impossible contents
    AeroTcCorruption,
    /// Engines could not resolve the recovered transactions
    AeroTcRecoveryFailed,
    /// A cookie names no slot, or a slot holding another xid
    AeroTcInvalidCookie,
    /// The underlying log writer failed
    AeroTcLog,
    /// A storage engine failed prepare, commit or rollback
    AeroTcEngine,
    AeroTcInvalidConfig,
    /// The commit log has been closed
    AeroTcClosed,
}

impl TcErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            TcErrorCode::AeroTcBadMagic => "AERO_TC_BAD_MAGIC",
            TcErrorCode::AeroTcEngineMismatch => "AERO_TC_ENGINE_MISMATCH",
            TcErrorCode::AeroTcSyncFailed => "AERO_TC_SYNC_FAILED",
            TcErrorCode::AeroTcIo => "AERO_TC_IO",
            TcErrorCode::AeroTcCorruption => "AERO_TC_CORRUPTION",
            TcErrorCode::AeroTcRecoveryFailed => "AERO_TC_RECOVERY_FAILED",
            TcErrorCode::AeroTcInvalidCookie => "AERO_TC_INVALID_COOKIE",
            TcErrorCode::AeroTcLog => "AERO_TC_LOG",
            TcErrorCode::AeroTcEngine => "AERO_TC_ENGINE",
            TcErrorCode::AeroTcInvalidConfig => "AERO_TC_INVALID_CONFIG",
            TcErrorCode::AeroTcClosed => "AERO_TC_CLOSED",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            TcErrorCode::AeroTcBadMagic
            | TcErrorCode::AeroTcEngineMismatch
            | TcErrorCode::AeroTcCorruption
            | TcErrorCode::AeroTcRecoveryFailed => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for TcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Commit-log error with code, message and optional cause
#[derive(Debug)]
pub struct TcError {
    code: TcErrorCode,
    message: String,
    details: Option<String>,
    log_code: Option<LogErrorCode>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl TcError {
    fn new(code: TcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            log_code: None,
            source: None,
        }
    }

    fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attaches free-form context, rendered in parentheses after the message
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_magic(path: &str) -> Self {
        Self::new(
            TcErrorCode::AeroTcBadMagic,
            format!("{} is not a commit log", path),
        )
    }

    pub fn engine_mismatch(found: u8, expected: usize) -> Self {
        Self::new(
            TcErrorCode::AeroTcEngineMismatch,
            "commit log was created for a different set of engines",
        )
        .with_details(format!("file: {}, running: {}", found, expected))
    }

    pub fn sync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(TcErrorCode::AeroTcSyncFailed, message).with_source(source)
    }

    /// Sync failure reported to a commit that shared another thread's sync
    pub fn page_sync_failed(page: usize) -> Self {
        Self::new(TcErrorCode::AeroTcSyncFailed, "commit log page sync failed")
            .with_details(format!("page: {}", page))
    }

    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(TcErrorCode::AeroTcIo, message).with_source(source)
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(TcErrorCode::AeroTcCorruption, message)
    }

    pub fn recovery_failed(message: impl Into<String>) -> Self {
        Self::new(TcErrorCode::AeroTcRecoveryFailed, message)
    }

    pub fn invalid_cookie(message: impl Into<String>) -> Self {
        Self::new(TcErrorCode::AeroTcInvalidCookie, message)
    }

    pub fn engine(source: EngineError) -> Self {
        Self::new(TcErrorCode::AeroTcEngine, source.to_string()).with_source(source)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(TcErrorCode::AeroTcInvalidConfig, message)
    }

    pub fn closed() -> Self {
        Self::new(TcErrorCode::AeroTcClosed, "commit log is closed")
    }

    /// Returns the error code
    pub fn code(&self) -> TcErrorCode {
        self.code
    }

    /// Code of the wrapped log writer error, for `AERO_TC_LOG`
    pub fn log_code(&self) -> Option<LogErrorCode> {
        self.log_code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether the process must not continue without operator action
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl From<LogError> for TcError {
    fn from(err: LogError) -> Self {
        let mut tc = Self::new(TcErrorCode::AeroTcLog, err.to_string());
        tc.log_code = Some(err.code());
        tc.with_source(err)
    }
}

impl fmt::Display for TcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for TcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result type for commit-log operations
pub type TcResult<T> = Result<T, TcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_codes() {
        assert!(TcError::bad_magic("tc.log").is_fatal());
        assert!(TcError::engine_mismatch(2, 1).is_fatal());
        assert!(TcError::recovery_failed("engine refused").is_fatal());
        assert!(!TcError::page_sync_failed(3).is_fatal());
        assert!(!TcError::invalid_cookie("slot out of range").is_fatal());
    }

    #[test]
    fn test_engine_mismatch_display() {
        let display = TcError::engine_mismatch(2, 1).to_string();
        assert!(display.starts_with("[FATAL] AERO_TC_ENGINE_MISMATCH"));
        assert!(display.contains("file: 2, running: 1"));
    }

    #[test]
    fn test_wraps_log_error() {
        use std::error::Error;
        let err: TcError = LogError::disabled("fsync failed").into();
        assert_eq!(err.code(), TcErrorCode::AeroTcLog);
        assert_eq!(err.log_code(), Some(LogErrorCode::AeroLogDisabled));
        assert!(err.message().contains("AERO_LOG_DISABLED"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_engine_error() {
        let err = TcError::engine(EngineError::Prepare {
            engine: "memory".to_string(),
            xid: 7,
            reason: "lock wait timeout".to_string(),
        });
        assert_eq!(err.code(), TcErrorCode::AeroTcEngine);
        assert!(err.message().contains("memory"));
    }
}
