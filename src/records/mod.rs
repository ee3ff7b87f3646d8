//! Backup records
//!
//! One `BackupRecord` per attempted backup: the audit trail operators
//! poll for progress and use to pick an archive for restore.
//!
//! Lifecycle: `pending → in_progress → completed | failed`. Terminal
//! records are immutable apart from their cloud-sync and restore-history
//! fields. A record still `pending` or `in_progress` when the service
//! starts belongs to a process that died; it is failed as interrupted.

mod manager;

pub use manager::{BackupRecordManager, RecordFilter, RecordPage, RecordStats, INTERRUPTED_MESSAGE};
pub(crate) use manager::remove_archive_files;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scope::BackupScope;
use crate::store::{Keyed, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Manual,
    Scheduled,
    PreUpdate,
    PreRestore,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Manual => "manual",
            BackupType::Scheduled => "scheduled",
            BackupType::PreUpdate => "pre_update",
            BackupType::PreRestore => "pre_restore",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(BackupType::Manual),
            "scheduled" => Ok(BackupType::Scheduled),
            "pre_update" => Ok(BackupType::PreUpdate),
            "pre_restore" => Ok(BackupType::PreRestore),
            other => Err(format!("unknown backup type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Failed)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "in_progress" => Ok(BackupStatus::InProgress),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(format!("unknown backup status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub scope: BackupScope,

    // Archive
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub checksum: Option<String>,
    pub table_count: u64,
    pub record_count: u64,
    pub uploaded_files_count: u64,
    pub uploaded_files_size: u64,
    pub app_version: String,
    pub schema_version: String,

    // Cloud sync
    pub cloud_provider: Option<String>,
    pub cloud_path: Option<String>,
    pub is_cloud_synced: bool,
    pub cloud_synced_at: Option<DateTime<Utc>>,
    pub cloud_sync_error: Option<String>,

    // Restores from this archive
    #[serde(default)]
    pub restored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restored_by: Option<String>,
    #[serde(default)]
    pub restore_count: u64,
    /// Most recent failed restore, cleared by the next success
    #[serde(default)]
    pub last_restore_error: Option<String>,

    pub error_message: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Schedule that produced this backup
    #[serde(default)]
    pub schedule_id: Option<Uuid>,
}

impl Keyed for BackupRecord {
    fn key(&self) -> Uuid {
        self.id
    }
}

/// Request to open a new record
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub backup_type: BackupType,
    pub scope: BackupScope,
    pub name: String,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub schedule_id: Option<Uuid>,
}

impl NewBackup {
    pub fn new(backup_type: BackupType, scope: BackupScope, name: impl Into<String>) -> Self {
        Self {
            backup_type,
            scope,
            name: name.into(),
            description: None,
            created_by: None,
            schedule_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("backup record {0} not found")]
    NotFound(Uuid),

    #[error("backup record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: BackupStatus,
        to: BackupStatus,
    },

    #[error("backup record {0} is in progress")]
    InProgress(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RecordResult<T> = Result<T, RecordError>;
