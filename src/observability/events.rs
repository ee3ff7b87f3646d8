//! Observable lifecycle events of the backup pipeline
//!
//! Events are explicit and typed. Start/complete pairs for whole runs
//! are emitted by `ObservationScope`; these cover the steps in between.

use std::fmt;

use super::logger::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Process
    /// Configuration loaded and validated
    ConfigLoaded,
    /// HTTP API listening
    ServerStart,

    // Backup
    /// One table written to the staging directory
    TableDumped,
    /// Archive renamed into place
    ArchiveWritten,
    /// Partial archive removed after a failure
    PartialArchiveRemoved,
    /// Backup stopped at a table boundary
    BackupCancelled,
    /// A second run was refused while one is active
    ConcurrentOperationRejected,
    /// Uploaded file left out of the archive
    UploadSkipped,
    /// Record left running by a previous process marked failed
    InterruptedBackupRecovered,

    // Records
    /// Record moved to a new status
    RecordTransition,
    /// Record deleted
    RecordDeleted,

    // Cloud
    /// Archive uploaded to the provider
    CloudSyncComplete,
    /// Upload failed; local backup unaffected
    CloudSyncFailed,
    /// OAuth access token refreshed and persisted
    TokenRefreshed,
    /// OAuth code exchanged and tokens stored
    CloudConnected,
    /// Stored OAuth tokens removed
    CloudDisconnected,
    /// Remote archive copied into the backup directory
    CloudDownloaded,
    /// Remote archive deleted
    CloudDeleted,

    // Restore
    /// Validation finished
    RestoreValidated,
    /// Validation produced warnings that need acknowledgment
    RestoreWarning,
    /// Pre-restore safety backup taken
    SafetyBackupCreated,
    /// One table applied
    RestoreTableApplied,
    /// Uploaded files copied back
    RestoreFilesCopied,
    /// Cancellation refused after the first destructive write
    RestoreCancelRejected,

    // Schedules
    /// A due schedule produced a backup
    ScheduleRun,
    /// A due schedule failed
    ScheduleFailed,
    /// Expired scheduled backup removed
    RetentionDeleted,
}

impl Event {
    /// Returns the event name
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::ServerStart => "SERVER_START",
            Event::TableDumped => "TABLE_DUMPED",
            Event::ArchiveWritten => "ARCHIVE_WRITTEN",
            Event::PartialArchiveRemoved => "PARTIAL_ARCHIVE_REMOVED",
            Event::BackupCancelled => "BACKUP_CANCELLED",
            Event::ConcurrentOperationRejected => "CONCURRENT_OPERATION_REJECTED",
            Event::UploadSkipped => "UPLOAD_SKIPPED",
            Event::InterruptedBackupRecovered => "INTERRUPTED_BACKUP_RECOVERED",
            Event::RecordTransition => "RECORD_TRANSITION",
            Event::RecordDeleted => "RECORD_DELETED",
            Event::CloudSyncComplete => "CLOUD_SYNC_COMPLETE",
            Event::CloudSyncFailed => "CLOUD_SYNC_FAILED",
            Event::TokenRefreshed => "TOKEN_REFRESHED",
            Event::CloudConnected => "CLOUD_CONNECTED",
            Event::CloudDisconnected => "CLOUD_DISCONNECTED",
            Event::CloudDownloaded => "CLOUD_DOWNLOADED",
            Event::CloudDeleted => "CLOUD_DELETED",
            Event::RestoreValidated => "RESTORE_VALIDATED",
            Event::RestoreWarning => "RESTORE_WARNING",
            Event::SafetyBackupCreated => "SAFETY_BACKUP_CREATED",
            Event::RestoreTableApplied => "RESTORE_TABLE_APPLIED",
            Event::RestoreFilesCopied => "RESTORE_FILES_COPIED",
            Event::RestoreCancelRejected => "RESTORE_CANCEL_REJECTED",
            Event::ScheduleRun => "SCHEDULE_RUN",
            Event::ScheduleFailed => "SCHEDULE_FAILED",
            Event::RetentionDeleted => "RETENTION_DELETED",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::TableDumped | Event::RestoreTableApplied | Event::RecordTransition => {
                Severity::Trace
            }
            Event::PartialArchiveRemoved
            | Event::BackupCancelled
            | Event::ConcurrentOperationRejected
            | Event::UploadSkipped
            | Event::InterruptedBackupRecovered
            | Event::CloudSyncFailed
            | Event::RestoreWarning
            | Event::RestoreCancelRejected => Severity::Warn,
            Event::ScheduleFailed => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_upper_snake() {
        for event in [
            Event::TableDumped,
            Event::CloudSyncFailed,
            Event::RestoreCancelRejected,
            Event::RetentionDeleted,
        ] {
            let name = event.as_str();
            assert!(name.chars().all(|c| c.is_ascii_uppercase() || c == '_'), "{}", name);
        }
    }

    #[test]
    fn test_cloud_failure_is_warning_not_error() {
        assert_eq!(Event::CloudSyncFailed.severity(), Severity::Warn);
    }
}
