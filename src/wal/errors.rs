//! Log writer error types
//!
//! Error codes:
//! - AERO_LOG_WRITE_FAILED (ERROR severity)
//! - AERO_LOG_FSYNC_FAILED (FATAL severity, logging is disabled)
//! - AERO_LOG_DISABLED (FATAL severity, sticky until re-open)
//! - AERO_LOG_CORRUPTION (FATAL severity)
//! - AERO_LOG_INDEX_FAILED (ERROR severity)
//! - AERO_LOG_PURGE_FAILED (ERROR severity)
//! - AERO_LOG_NOT_IN_INDEX (ERROR severity)
//! - AERO_LOG_CACHE_FULL (ERROR severity)
//! - AERO_LOG_NOT_OPEN (ERROR severity)
//! - AERO_LOG_CACHE_NOT_EMPTY (ERROR severity)
//!
//! "Fatal" here is fatal for logging, not for the server: the writer moves
//! to its disabled state and every later write reports the same error.

use std::fmt;
use std::io;

/// Severity levels for log errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, logging continues
    Error,
    /// Logging cannot continue without operator action
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Log-specific error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogErrorCode {
    /// Writing a record or cache to the active file failed
    AeroLogWriteFailed,
    /// fsync of the active file failed
    AeroLogFsyncFailed,
    /// Logging was disabled by an earlier I/O failure
    AeroLogDisabled,
    /// A log file failed structural validation
    AeroLogCorruption,
    /// Reading or updating the index file failed
    AeroLogIndexFailed,
    /// Purging log files failed
    AeroLogPurgeFailed,
    /// The named file is not present in the index
    AeroLogNotInIndex,
    /// The transaction cache exceeded its configured limit
    AeroLogCacheFull,
    /// The writer has been closed
    AeroLogNotOpen,
    /// A session ended with records still buffered
    AeroLogCacheNotEmpty,
}

impl LogErrorCode {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            LogErrorCode::AeroLogWriteFailed => "AERO_LOG_WRITE_FAILED",
            LogErrorCode::AeroLogFsyncFailed => "AERO_LOG_FSYNC_FAILED",
            LogErrorCode::AeroLogDisabled => "AERO_LOG_DISABLED",
            LogErrorCode::AeroLogCorruption => "AERO_LOG_CORRUPTION",
            LogErrorCode::AeroLogIndexFailed => "AERO_LOG_INDEX_FAILED",
            LogErrorCode::AeroLogPurgeFailed => "AERO_LOG_PURGE_FAILED",
            LogErrorCode::AeroLogNotInIndex => "AERO_LOG_NOT_IN_INDEX",
            LogErrorCode::AeroLogCacheFull => "AERO_LOG_CACHE_FULL",
            LogErrorCode::AeroLogNotOpen => "AERO_LOG_NOT_OPEN",
            LogErrorCode::AeroLogCacheNotEmpty => "AERO_LOG_CACHE_NOT_EMPTY",
        }
    }

    /// Returns the severity level for this error
    pub fn severity(&self) -> Severity {
        match self {
            LogErrorCode::AeroLogFsyncFailed
            | LogErrorCode::AeroLogDisabled
            | LogErrorCode::AeroLogCorruption => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for LogErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Log error with code, message and optional I/O cause
#[derive(Debug)]
pub struct LogError {
    code: LogErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl LogError {
    fn new(code: LogErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    fn with_source(mut self, source: io::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Attaches free-form context, rendered in parentheses after the message
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Create a write failure
    pub fn write_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(LogErrorCode::AeroLogWriteFailed, message).with_source(source)
    }

    /// Create an fsync failure
    pub fn fsync_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(LogErrorCode::AeroLogFsyncFailed, message).with_source(source)
    }

    /// Create the error returned while logging is disabled
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self::new(LogErrorCode::AeroLogDisabled, "cannot write to log: logging is disabled")
            .with_details(reason)
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(LogErrorCode::AeroLogCorruption, message)
    }

    /// Create a corruption error with byte offset context
    pub fn corruption_at_offset(offset: u64, reason: impl Into<String>) -> Self {
        Self::new(LogErrorCode::AeroLogCorruption, reason)
            .with_details(format!("byte_offset: {}", offset))
    }

    /// Create an index failure
    pub fn index_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(LogErrorCode::AeroLogIndexFailed, message).with_source(source)
    }

    /// Create a purge failure
    pub fn purge_failed(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(LogErrorCode::AeroLogPurgeFailed, message).with_source(source)
    }

    /// Create a not-in-index error
    pub fn not_in_index(name: &str) -> Self {
        Self::new(
            LogErrorCode::AeroLogNotInIndex,
            format!("log file not found in index: {}", name),
        )
    }

    /// Create a cache-full error
    pub fn cache_full(limit: u64) -> Self {
        Self::new(
            LogErrorCode::AeroLogCacheFull,
            "transaction cache exceeded its size limit",
        )
        .with_details(format!("max_cache_size: {}", limit))
    }

    /// Create a not-open error
    pub fn not_open() -> Self {
        Self::new(LogErrorCode::AeroLogNotOpen, "log writer is closed")
    }

    /// Create the error for a session closed with buffered records
    pub fn cache_not_empty(buffered: u64) -> Self {
        Self::new(
            LogErrorCode::AeroLogCacheNotEmpty,
            "session closed with an unwritten transaction cache",
        )
        .with_details(format!("buffered_bytes: {}", buffered))
    }

    /// Returns the error code
    pub fn code(&self) -> LogErrorCode {
        self.code
    }

    /// Returns the severity level
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Returns the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns whether this error means logging cannot continue
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for LogError {
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

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for log operations
pub type LogResult<T> = Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LogErrorCode::AeroLogWriteFailed.code(), "AERO_LOG_WRITE_FAILED");
        assert_eq!(LogErrorCode::AeroLogFsyncFailed.code(), "AERO_LOG_FSYNC_FAILED");
        assert_eq!(LogErrorCode::AeroLogDisabled.code(), "AERO_LOG_DISABLED");
        assert_eq!(LogErrorCode::AeroLogNotInIndex.code(), "AERO_LOG_NOT_IN_INDEX");
    }

    #[test]
    fn test_severities() {
        assert_eq!(LogErrorCode::AeroLogWriteFailed.severity(), Severity::Error);
        assert_eq!(LogErrorCode::AeroLogFsyncFailed.severity(), Severity::Fatal);
        assert_eq!(LogErrorCode::AeroLogDisabled.severity(), Severity::Fatal);
        assert_eq!(LogErrorCode::AeroLogCacheFull.severity(), Severity::Error);
    }

    #[test]
    fn test_disabled_display_carries_reason() {
        let err = LogError::disabled("fsync of aerolog-bin.000002 failed");
        let display = format!("{}", err);
        assert!(display.contains("[FATAL]"));
        assert!(display.contains("AERO_LOG_DISABLED"));
        assert!(display.contains("cannot write to log"));
        assert!(display.contains("aerolog-bin.000002"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_source_is_exposed() {
        use std::error::Error;
        let err = LogError::write_failed(
            "short write",
            io::Error::new(io::ErrorKind::WriteZero, "disk full"),
        );
        assert!(err.source().is_some());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_corruption_at_offset_details() {
        let err = LogError::corruption_at_offset(4096, "truncated record header");
        assert_eq!(err.details(), Some("byte_offset: 4096"));
        assert_eq!(err.code(), LogErrorCode::AeroLogCorruption);
    }
}
