//! Restore error types
//!
//! Codes follow the NEXUS_CATEGORY_NAME format. Errors raised before the
//! first write are ERROR severity: nothing changed. Errors raised while
//! applying tables are FATAL: the database is partially restored and the
//! operator must recover from the pre-restore safety backup.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::Path;

use serde::Serialize;

use crate::backup::BackupError;
use crate::database::DatabaseError;
use crate::lock::ActiveOperation;
use crate::observability::Severity;

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestoreErrorCode {
    /// Archive bytes differ from the recorded checksum
    ChecksumMismatch,
    /// Archive unreadable, manifest missing or entries inconsistent
    InvalidArchive,
    /// Validation warnings were not acknowledged
    WarningsNotAcknowledged,
    /// A row references a parent row that does not exist
    ForeignKeyViolation,
    /// Replace requested without a safety backup or explicit override
    SafetyBackupRequired,
    /// Target scope is not contained in the archive's scope
    ScopeNotInArchive,
    /// A table could not be applied
    TableFailed,
    /// Another backup or restore holds the operation lock
    ConcurrentOperation,
    /// Cancelled before the first write
    Cancelled,
    /// Filesystem failure
    Io,
}

impl RestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreErrorCode::ChecksumMismatch => "NEXUS_RESTORE_CHECKSUM_MISMATCH",
            RestoreErrorCode::InvalidArchive => "NEXUS_RESTORE_INVALID_ARCHIVE",
            RestoreErrorCode::WarningsNotAcknowledged => "NEXUS_RESTORE_WARNINGS_NOT_ACKNOWLEDGED",
            RestoreErrorCode::ForeignKeyViolation => "NEXUS_RESTORE_FOREIGN_KEY_VIOLATION",
            RestoreErrorCode::SafetyBackupRequired => "NEXUS_RESTORE_SAFETY_BACKUP_REQUIRED",
            RestoreErrorCode::ScopeNotInArchive => "NEXUS_RESTORE_SCOPE_NOT_IN_ARCHIVE",
            RestoreErrorCode::TableFailed => "NEXUS_RESTORE_TABLE_FAILED",
            RestoreErrorCode::ConcurrentOperation => "NEXUS_RESTORE_CONCURRENT_OPERATION",
            RestoreErrorCode::Cancelled => "NEXUS_RESTORE_CANCELLED",
            RestoreErrorCode::Io => "NEXUS_RESTORE_IO",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RestoreErrorCode::ForeignKeyViolation | RestoreErrorCode::TableFailed => {
                Severity::Fatal
            }
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for RestoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How far a restore got before it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreProgress {
    pub tables_applied: u64,
    pub rows_applied: u64,
    pub files_restored: u64,
}

#[derive(Debug)]
pub struct RestoreError {
    code: RestoreErrorCode,
    message: String,
    table: Option<String>,
    progress: Option<RestoreProgress>,
    source: Option<BoxedSource>,
}

impl RestoreError {
    fn new(code: RestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            table: None,
            progress: None,
            source: None,
        }
    }

    fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    fn with_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    /// Attach how much was applied before the failure
    pub fn with_progress(mut self, progress: RestoreProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Lift a validation finding into an error
    pub(crate) fn from_issue(code: RestoreErrorCode, message: &str) -> Self {
        Self::new(code, message)
    }

    pub fn checksum_mismatch(expected: &str, actual: &str) -> Self {
        Self::new(
            RestoreErrorCode::ChecksumMismatch,
            format!(
                "Archive checksum mismatch: expected {}, computed {}",
                expected, actual
            ),
        )
    }

    pub fn invalid_archive(message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::InvalidArchive, message)
    }

    pub fn invalid_archive_io(message: impl Into<String>, cause: io::Error) -> Self {
        Self::new(RestoreErrorCode::InvalidArchive, message).with_source(cause)
    }

    pub fn warnings_not_acknowledged(count: usize) -> Self {
        Self::new(
            RestoreErrorCode::WarningsNotAcknowledged,
            format!(
                "Archive validation produced {} warning(s) that must be acknowledged",
                count
            ),
        )
    }

    /// Row-level referential failure; names the row and the missing parent
    pub fn foreign_key_violation(table: &str, cause: DatabaseError) -> Self {
        Self::new(
            RestoreErrorCode::ForeignKeyViolation,
            format!("Foreign key violation restoring {}: {}", table, cause),
        )
        .with_table(table)
        .with_source(cause)
    }

    pub fn safety_backup_required() -> Self {
        Self::new(
            RestoreErrorCode::SafetyBackupRequired,
            "Replace restore requires a pre-restore safety backup or an explicit force_without_safety_backup override",
        )
    }

    pub fn safety_backup_failed(cause: BackupError) -> Self {
        Self::new(
            RestoreErrorCode::SafetyBackupRequired,
            format!("Pre-restore safety backup failed: {}", cause.message()),
        )
        .with_source(cause)
    }

    pub fn scope_not_in_archive(target: &str, archive: &str) -> Self {
        Self::new(
            RestoreErrorCode::ScopeNotInArchive,
            format!(
                "Requested scope '{}' is not contained in archive scope '{}'",
                target, archive
            ),
        )
    }

    pub fn table_failed(table: &str, cause: DatabaseError) -> Self {
        Self::new(
            RestoreErrorCode::TableFailed,
            format!("Failed to restore table {}: {}", table, cause),
        )
        .with_table(table)
        .with_source(cause)
    }

    pub fn table_decode(table: &str, message: impl Into<String>) -> Self {
        Self::new(
            RestoreErrorCode::TableFailed,
            format!("Failed to read rows of {}: {}", table, message.into()),
        )
        .with_table(table)
    }

    pub fn concurrent_operation(active: &ActiveOperation) -> Self {
        Self::new(
            RestoreErrorCode::ConcurrentOperation,
            format!("Cannot start restore: {}", active),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(
            RestoreErrorCode::Cancelled,
            "Restore cancelled before any change was applied",
        )
    }

    pub fn io_error(message: impl Into<String>, cause: io::Error) -> Self {
        Self::new(RestoreErrorCode::Io, message).with_source(cause)
    }

    pub fn io_error_at_path(path: &Path, cause: io::Error) -> Self {
        Self::io_error(format!("I/O error at {}", path.display()), cause)
    }

    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(RestoreErrorCode::Io, message)
    }

    pub fn code(&self) -> RestoreErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Table being applied when the failure happened
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn progress(&self) -> Option<&RestoreProgress> {
        self.progress.as_ref()
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }
}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code, self.message)?;
        if let Some(ref progress) = self.progress {
            write!(
                f,
                " (applied {} table(s), {} row(s) before stopping)",
                progress.tables_applied, progress.rows_applied
            )?;
        }
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl StdError for RestoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

pub type RestoreResult<T> = Result<T, RestoreError>;
