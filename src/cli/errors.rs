//! CLI error types
//!
//! Every CLI error ends the process with exit status 1.

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::tc::TcError;
use crate::wal::LogError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file missing or invalid
    ConfigError,
    /// stdout could not be written
    IoError,
    /// A command argument could not be used
    InvalidArgument,
    /// The log writer, index or a log file failed
    LogError,
    /// The commit log failed
    CommitLogError,
    /// A crashed log still holds commit decisions the engines need
    UnresolvedCrash,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "AERO_CLI_CONFIG_ERROR",
            Self::IoError => "AERO_CLI_IO_ERROR",
            Self::InvalidArgument => "AERO_CLI_INVALID_ARGUMENT",
            Self::LogError => "AERO_CLI_LOG_ERROR",
            Self::CommitLogError => "AERO_CLI_COMMIT_LOG_ERROR",
            Self::UnresolvedCrash => "AERO_CLI_UNRESOLVED_CRASH",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, msg)
    }

    pub fn unresolved_crash(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::UnresolvedCrash, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<LogError> for CliError {
    fn from(e: LogError) -> Self {
        Self::new(CliErrorCode::LogError, e.to_string())
    }
}

impl From<TcError> for CliError {
    fn from(e: TcError) -> Self {
        Self::new(CliErrorCode::CommitLogError, e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
