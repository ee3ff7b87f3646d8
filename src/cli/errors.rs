//! CLI-specific error types
//!
//! Backup, restore and cloud failures keep their own codes so the JSON
//! error response carries `NEXUS_BACKUP_*`, `NEXUS_RESTORE_*` and
//! `NEXUS_CLOUD_*` unchanged.

use std::fmt;
use std::io;

use crate::backup::{BackupError, BackupErrorCode};
use crate::cloud::CloudError;
use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::restore::{RestoreError, RestoreErrorCode};
use crate::schedule::ScheduleError;

/// CLI error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file or environment error
    ConfigError,
    /// I/O error (stdout, runtime)
    IoError,
    /// Argument could not be interpreted
    InvalidArgument,
    /// Database file could not be loaded or saved
    DatabaseError,
    /// Schedule store or cron failure
    ScheduleError,
    /// HTTP server failed to start or stopped with an error
    ServeFailed,
    Backup(BackupErrorCode),
    Restore(RestoreErrorCode),
    /// `CloudError::code()`
    Cloud(&'static str),
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "NEXUS_CLI_CONFIG_ERROR",
            Self::IoError => "NEXUS_CLI_IO_ERROR",
            Self::InvalidArgument => "NEXUS_CLI_INVALID_ARGUMENT",
            Self::DatabaseError => "NEXUS_CLI_DATABASE_ERROR",
            Self::ScheduleError => "NEXUS_CLI_SCHEDULE_ERROR",
            Self::ServeFailed => "NEXUS_CLI_SERVE_FAILED",
            Self::Backup(code) => code.as_str(),
            Self::Restore(code) => code.as_str(),
            Self::Cloud(code) => code,
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
    /// Create a new CLI error
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

    pub fn serve_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ServeFailed, msg)
    }

    /// Get the error code
    pub fn code(&self) -> CliErrorCode {
        self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
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

impl From<DatabaseError> for CliError {
    fn from(e: DatabaseError) -> Self {
        Self::new(CliErrorCode::DatabaseError, e.to_string())
    }
}

impl From<ScheduleError> for CliError {
    fn from(e: ScheduleError) -> Self {
        Self::new(CliErrorCode::ScheduleError, e.to_string())
    }
}

impl From<BackupError> for CliError {
    fn from(e: BackupError) -> Self {
        Self::new(CliErrorCode::Backup(e.code()), e.to_string())
    }
}

impl From<RestoreError> for CliError {
    fn from(e: RestoreError) -> Self {
        Self::new(CliErrorCode::Restore(e.code()), e.to_string())
    }
}

impl From<CloudError> for CliError {
    fn from(e: CloudError) -> Self {
        Self::new(CliErrorCode::Cloud(e.code()), e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
