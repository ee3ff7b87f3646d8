//! Scheduled backups
//!
//! A schedule is a cron expression plus the backup it should produce.
//! The runner wakes once a minute, runs every due schedule through the
//! backup service and prunes that schedule's expired archives.

mod manager;
mod runner;

pub use manager::{next_run_after, ScheduleManager};
pub use runner::{ScheduleRunResult, ScheduleRunner, TICK_INTERVAL};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scope::BackupScope;
use crate::store::{Keyed, StoreError};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const MAX_RETENTION_DAYS: u32 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Five-field cron expression, evaluated in UTC
    pub cron_expression: String,
    pub scope: BackupScope,
    pub is_enabled: bool,
    pub retention_days: u32,
    pub sync_to_cloud: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// May point at a record that has since been deleted
    pub last_backup_id: Option<Uuid>,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Keyed for BackupSchedule {
    fn key(&self) -> Uuid {
        self.id
    }
}

fn default_enabled() -> bool {
    true
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cron_expression: String,
    pub scope: BackupScope,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub sync_to_cloud: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl NewSchedule {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>, scope: BackupScope) -> Self {
        Self {
            name: name.into(),
            description: None,
            cron_expression: cron_expression.into(),
            scope,
            is_enabled: true,
            retention_days: DEFAULT_RETENTION_DAYS,
            sync_to_cloud: false,
            created_by: None,
        }
    }
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron_expression: Option<String>,
    pub scope: Option<BackupScope>,
    pub is_enabled: Option<bool>,
    pub retention_days: Option<u32>,
    pub sync_to_cloud: Option<bool>,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule {0} not found")]
    NotFound(Uuid),

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid schedule: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;
