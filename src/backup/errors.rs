//! Backup error types
//!
//! Codes follow the NEXUS_CATEGORY_NAME format. Every backup error is
//! ERROR severity: a failed backup never damages the live database, it
//! only leaves a `failed` record behind.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::Path;

use crate::database::DatabaseError;
use crate::lock::ActiveOperation;
use crate::observability::Severity;
use crate::records::RecordError;

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupErrorCode {
    /// Unrecognized scope value or unusable scope configuration
    InvalidScope,
    /// A table could not be read or encoded
    TableDump,
    /// The archive could not be written; the partial file is gone
    ArchiveWrite,
    /// Another backup or restore holds the operation lock
    ConcurrentOperation,
    /// Cancelled at a table boundary
    Cancelled,
    /// The backup record could not be updated
    Record,
    /// Filesystem failure outside archive writing
    Io,
    /// Unknown backup id
    NotFound,
}

impl BackupErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupErrorCode::InvalidScope => "NEXUS_BACKUP_INVALID_SCOPE",
            BackupErrorCode::TableDump => "NEXUS_BACKUP_TABLE_DUMP",
            BackupErrorCode::ArchiveWrite => "NEXUS_BACKUP_ARCHIVE_WRITE",
            BackupErrorCode::ConcurrentOperation => "NEXUS_BACKUP_CONCURRENT_OPERATION",
            BackupErrorCode::Cancelled => "NEXUS_BACKUP_CANCELLED",
            BackupErrorCode::Record => "NEXUS_BACKUP_RECORD",
            BackupErrorCode::Io => "NEXUS_BACKUP_IO",
            BackupErrorCode::NotFound => "NEXUS_BACKUP_NOT_FOUND",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Error
    }
}

impl fmt::Display for BackupErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backup error with full context
#[derive(Debug)]
pub struct BackupError {
    code: BackupErrorCode,
    message: String,
    /// Table being dumped when the failure happened
    table: Option<String>,
    source: Option<BoxedSource>,
}

impl BackupError {
    fn new(code: BackupErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            table: None,
            source: None,
        }
    }

    fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn invalid_scope(value: &str) -> Self {
        Self::new(
            BackupErrorCode::InvalidScope,
            format!(
                "Unknown backup scope '{}'; expected settings, data, database or full",
                value
            ),
        )
    }

    pub fn invalid_scope_config(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::InvalidScope, message)
    }

    pub fn table_dump(table: &str, cause: DatabaseError) -> Self {
        let mut err = Self::new(
            BackupErrorCode::TableDump,
            format!("Failed to dump table {}: {}", table, cause),
        )
        .with_source(cause);
        err.table = Some(table.to_string());
        err
    }

    pub fn table_dump_io(table: &str, cause: io::Error) -> Self {
        let mut err = Self::new(
            BackupErrorCode::TableDump,
            format!("Failed to write dump of table {}: {}", table, cause),
        )
        .with_source(cause);
        err.table = Some(table.to_string());
        err
    }

    pub fn archive_write(message: impl Into<String>, cause: io::Error) -> Self {
        Self::new(BackupErrorCode::ArchiveWrite, message).with_source(cause)
    }

    pub fn archive_write_msg(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::ArchiveWrite, message)
    }

    pub fn concurrent_operation(active: &ActiveOperation) -> Self {
        Self::new(
            BackupErrorCode::ConcurrentOperation,
            format!("Another operation is already in progress: {}", active),
        )
    }

    pub fn cancelled(before_table: Option<&str>) -> Self {
        let message = match before_table {
            Some(table) => format!("Backup cancelled before table {}", table),
            None => "Backup cancelled before packaging".to_string(),
        };
        Self::new(BackupErrorCode::Cancelled, message)
    }

    pub fn record(cause: RecordError) -> Self {
        Self::new(
            BackupErrorCode::Record,
            format!("Backup record update failed: {}", cause),
        )
        .with_source(cause)
    }

    pub fn io_error(message: impl Into<String>, cause: io::Error) -> Self {
        Self::new(BackupErrorCode::Io, message).with_source(cause)
    }

    pub fn io_error_at_path(path: &Path, cause: io::Error) -> Self {
        Self::io_error(format!("I/O error at {}", path.display()), cause)
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(BackupErrorCode::NotFound, format!("Backup not found: {}", what))
    }

    /// Failure of the background task running the pipeline
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::Io, message)
    }

    pub fn code(&self) -> BackupErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Table that failed, for `TableDump` errors
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl StdError for BackupError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

pub type BackupResult<T> = Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BackupErrorCode::TableDump.as_str(), "NEXUS_BACKUP_TABLE_DUMP");
        assert_eq!(
            BackupErrorCode::ConcurrentOperation.as_str(),
            "NEXUS_BACKUP_CONCURRENT_OPERATION"
        );
        assert_eq!(BackupErrorCode::InvalidScope.severity(), Severity::Error);
    }

    #[test]
    fn test_table_dump_names_table() {
        let err = BackupError::table_dump(
            "invoice",
            DatabaseError::Query("connection reset".to_string()),
        );
        assert_eq!(err.code(), BackupErrorCode::TableDump);
        assert_eq!(err.table(), Some("invoice"));

        let display = err.to_string();
        assert!(display.contains("[ERROR] NEXUS_BACKUP_TABLE_DUMP"));
        assert!(display.contains("invoice"));
        assert!(display.contains("connection reset"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_cancelled_message() {
        let err = BackupError::cancelled(Some("matter"));
        assert_eq!(err.code(), BackupErrorCode::Cancelled);
        assert!(err.message().contains("matter"));
    }

    #[test]
    fn test_archive_write_with_io_source() {
        let err = BackupError::archive_write(
            "Failed to write archive",
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        assert!(err.to_string().contains("caused by: disk full"));
    }
}
