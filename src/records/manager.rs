//! Record state transitions
//!
//! Every transition is a single `Store::put`. Repeating `complete` with
//! the same metadata, or `fail` on a failed record, returns the stored
//! record without writing. Cloud-sync and restore stamps go through
//! `Store::update` so they never bring back a record deleted meanwhile.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{BackupRecord, BackupStatus, BackupType, NewBackup, RecordError, RecordResult};
use crate::backup::{checksum, ArchiveMetadata};
use crate::cloud::{CloudError, RemoteObject};
use crate::fs_util;
use crate::observability::{log_event, Event};
use crate::scope::BackupScope;
use crate::store::Store;

/// Error message given to records left running by a process that died
pub const INTERRUPTED_MESSAGE: &str = "Interrupted: the process stopped before the backup finished";

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// Optional filters for `list`
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<BackupStatus>,
    pub backup_type: Option<BackupType>,
    pub scope: Option<BackupScope>,
    pub schedule_id: Option<Uuid>,
    /// Inclusive bounds on `created_at`
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// 1-based; only meaningful with `limit`
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    fn matches(&self, r: &BackupRecord) -> bool {
        self.status.map_or(true, |s| r.status == s)
            && self.backup_type.map_or(true, |t| r.backup_type == t)
            && self.scope.map_or(true, |s| r.scope == s)
            && self.schedule_id.map_or(true, |s| r.schedule_id == Some(s))
            && self.created_after.map_or(true, |at| r.created_at >= at)
            && self.created_before.map_or(true, |at| r.created_at <= at)
    }
}

/// One page of `list_page`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordPage {
    pub records: Vec<BackupRecord>,
    pub page: usize,
    pub limit: usize,
    /// Matching records across all pages
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordStats {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    /// Sum of completed archive sizes
    pub total_size: u64,
    pub cloud_synced: u64,
    pub last_successful_id: Option<Uuid>,
    pub last_successful_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct BackupRecordManager {
    store: Arc<dyn Store<BackupRecord>>,
    app_version: String,
    schema_version: String,
}

impl BackupRecordManager {
    pub fn new(
        store: Arc<dyn Store<BackupRecord>>,
        app_version: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            app_version: app_version.into(),
            schema_version: schema_version.into(),
        }
    }

    /// Create a `pending` record
    pub fn begin(&self, request: NewBackup) -> RecordResult<BackupRecord> {
        let record = BackupRecord {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            backup_type: request.backup_type,
            status: BackupStatus::Pending,
            scope: request.scope,
            file_path: None,
            file_size: None,
            checksum: None,
            table_count: 0,
            record_count: 0,
            uploaded_files_count: 0,
            uploaded_files_size: 0,
            app_version: self.app_version.clone(),
            schema_version: self.schema_version.clone(),
            cloud_provider: None,
            cloud_path: None,
            is_cloud_synced: false,
            cloud_synced_at: None,
            cloud_sync_error: None,
            restored_at: None,
            restored_by: None,
            restore_count: 0,
            last_restore_error: None,
            error_message: None,
            created_by: request.created_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            schedule_id: request.schedule_id,
        };
        self.store.put(record.clone())?;
        log_transition(&record, None);
        Ok(record)
    }

    /// `pending → in_progress`
    pub fn start(&self, id: Uuid) -> RecordResult<BackupRecord> {
        let mut record = self.get(id)?;
        if record.status != BackupStatus::Pending {
            return Err(invalid(&record, BackupStatus::InProgress));
        }
        let from = record.status;
        record.status = BackupStatus::InProgress;
        record.started_at = Some(Utc::now());
        self.store.put(record.clone())?;
        log_transition(&record, Some(from));
        Ok(record)
    }

    /// Move to `completed` and store the archive metadata
    pub fn complete(&self, id: Uuid, meta: &ArchiveMetadata) -> RecordResult<BackupRecord> {
        let mut record = self.get(id)?;
        match record.status {
            BackupStatus::Completed if same_archive(&record, meta) => return Ok(record),
            BackupStatus::Completed | BackupStatus::Failed => {
                return Err(invalid(&record, BackupStatus::Completed))
            }
            BackupStatus::Pending | BackupStatus::InProgress => {}
        }

        let from = record.status;
        let now = Utc::now();
        record.status = BackupStatus::Completed;
        record.file_path = Some(meta.file_path.clone());
        record.file_size = Some(meta.file_size);
        record.checksum = Some(meta.checksum.clone());
        record.table_count = meta.table_count;
        record.record_count = meta.record_count;
        record.uploaded_files_count = meta.uploaded_files_count;
        record.uploaded_files_size = meta.uploaded_files_size;
        record.app_version = meta.app_version.clone();
        record.schema_version = meta.schema_version.clone();
        record.started_at.get_or_insert(now);
        record.completed_at = Some(now);
        self.store.put(record.clone())?;
        log_transition(&record, Some(from));
        Ok(record)
    }

    /// Move to `failed` with `message`
    pub fn fail(&self, id: Uuid, message: &str) -> RecordResult<BackupRecord> {
        let mut record = self.get(id)?;
        match record.status {
            BackupStatus::Failed => return Ok(record),
            BackupStatus::Completed => return Err(invalid(&record, BackupStatus::Failed)),
            BackupStatus::Pending | BackupStatus::InProgress => {}
        }

        let from = record.status;
        record.status = BackupStatus::Failed;
        record.error_message = Some(message.to_string());
        record.completed_at = Some(Utc::now());
        self.store.put(record.clone())?;
        log_transition(&record, Some(from));
        Ok(record)
    }

    /// Write a cloud upload outcome. Only the sync fields change; the
    /// record must be `completed`.
    pub fn record_cloud_sync(
        &self,
        id: Uuid,
        provider: &str,
        outcome: Result<&RemoteObject, &CloudError>,
    ) -> RecordResult<BackupRecord> {
        let mut status = None;
        let record = self
            .store
            .update(id, &mut |record| {
                status = Some(record.status);
                if record.status != BackupStatus::Completed {
                    return false;
                }
                record.cloud_provider = Some(provider.to_string());
                match outcome {
                    Ok(remote) => {
                        record.cloud_path = Some(remote.path.clone());
                        record.is_cloud_synced = true;
                        record.cloud_synced_at = Some(Utc::now());
                        record.cloud_sync_error = None;
                    }
                    Err(e) => {
                        record.cloud_sync_error = Some(format!("{}: {}", e.code(), e));
                    }
                }
                true
            })?
            .ok_or(RecordError::NotFound(id))?;
        if status != Some(BackupStatus::Completed) {
            return Err(invalid(&record, BackupStatus::Completed));
        }
        Ok(record)
    }

    /// Stamp a restore from this record's archive. Success sets
    /// `restored_at`/`restored_by` and clears the last restore error;
    /// failure only records the error.
    pub fn record_restore(
        &self,
        id: Uuid,
        restored_by: Option<&str>,
        outcome: Result<(), &str>,
    ) -> RecordResult<BackupRecord> {
        self.store
            .update(id, &mut |record| {
                match outcome {
                    Ok(()) => {
                        record.restored_at = Some(Utc::now());
                        record.restored_by = restored_by.map(str::to_string);
                        record.restore_count += 1;
                        record.last_restore_error = None;
                    }
                    Err(message) => record.last_restore_error = Some(message.to_string()),
                }
                true
            })?
            .ok_or(RecordError::NotFound(id))
    }

    /// Fail every `pending` or `in_progress` record. Only valid while no
    /// backup can be running, i.e. before the service accepts work.
    pub fn fail_interrupted(&self) -> RecordResult<Vec<BackupRecord>> {
        let mut failed = Vec::new();
        for record in self.store.list()? {
            if record.status.is_terminal() {
                continue;
            }
            failed.push(self.fail(record.id, INTERRUPTED_MESSAGE)?);
        }
        Ok(failed)
    }

    pub fn get(&self, id: Uuid) -> RecordResult<BackupRecord> {
        self.store.get(id)?.ok_or(RecordError::NotFound(id))
    }

    /// Newest first
    pub fn list(&self, filter: &RecordFilter) -> RecordResult<Vec<BackupRecord>> {
        let mut records = self.filtered(filter)?;
        if let Some(limit) = filter.limit {
            let skip = filter.page.unwrap_or(1).max(1).saturating_sub(1) * limit;
            records = records.into_iter().skip(skip).take(limit).collect();
        }
        Ok(records)
    }

    /// Newest first, one page at a time. `limit` defaults to 20 and is
    /// capped at 100; `page` defaults to 1.
    pub fn list_page(&self, filter: &RecordFilter) -> RecordResult<RecordPage> {
        let records = self.filtered(filter)?;
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let page = filter.page.unwrap_or(1).max(1);
        let total = records.len();
        Ok(RecordPage {
            records: records
                .into_iter()
                .skip((page - 1).saturating_mul(limit))
                .take(limit)
                .collect(),
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit),
        })
    }

    fn filtered(&self, filter: &RecordFilter) -> RecordResult<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .store
            .list()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Remove a record, optionally with its archive and sidecar. Running
    /// backups cannot be deleted.
    pub fn delete(&self, id: Uuid, delete_file: bool) -> RecordResult<BackupRecord> {
        let record = self.get(id)?;
        if record.status == BackupStatus::InProgress {
            return Err(RecordError::InProgress(id));
        }

        if delete_file {
            if let Some(path) = record.file_path.as_deref() {
                remove_archive_files(Path::new(path));
            }
        }
        self.store.remove(id)?;
        log_event(
            Event::RecordDeleted,
            &[
                ("id", &id.to_string()),
                ("name", &record.name),
                ("file_deleted", if delete_file { "true" } else { "false" }),
            ],
        );
        Ok(record)
    }

    /// Delete every failed record; returns how many were removed
    pub fn cleanup_failed(&self) -> RecordResult<u64> {
        let failed = self.list(&RecordFilter {
            status: Some(BackupStatus::Failed),
            ..RecordFilter::default()
        })?;
        let mut removed = 0;
        for record in failed {
            self.delete(record.id, true)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn stats(&self) -> RecordResult<RecordStats> {
        let records = self.store.list()?;
        let mut stats = RecordStats {
            total: records.len() as u64,
            ..RecordStats::default()
        };

        for record in &records {
            match record.status {
                BackupStatus::Pending => stats.pending += 1,
                BackupStatus::InProgress => stats.in_progress += 1,
                BackupStatus::Failed => stats.failed += 1,
                BackupStatus::Completed => {
                    stats.completed += 1;
                    stats.total_size += record.file_size.unwrap_or(0);
                    let finished = record.completed_at.unwrap_or(record.created_at);
                    if stats.last_successful_at.map_or(true, |at| finished > at) {
                        stats.last_successful_at = Some(finished);
                        stats.last_successful_id = Some(record.id);
                    }
                }
            }
            if record.is_cloud_synced {
                stats.cloud_synced += 1;
            }
        }
        Ok(stats)
    }
}

fn same_archive(record: &BackupRecord, meta: &ArchiveMetadata) -> bool {
    record.file_path.as_deref() == Some(meta.file_path.as_str())
        && record.file_size == Some(meta.file_size)
        && record.checksum.as_deref() == Some(meta.checksum.as_str())
        && record.table_count == meta.table_count
        && record.record_count == meta.record_count
        && record.uploaded_files_count == meta.uploaded_files_count
        && record.uploaded_files_size == meta.uploaded_files_size
}

fn invalid(record: &BackupRecord, to: BackupStatus) -> RecordError {
    RecordError::InvalidTransition {
        id: record.id,
        from: record.status,
        to,
    }
}

fn log_transition(record: &BackupRecord, from: Option<BackupStatus>) {
    log_event(
        Event::RecordTransition,
        &[
            ("id", &record.id.to_string()),
            ("from", from.map(|s| s.as_str()).unwrap_or("-")),
            ("to", record.status.as_str()),
            ("scope", record.scope.as_str()),
        ],
    );
}

pub(crate) fn remove_archive_files(archive: &Path) {
    fs_util::remove_quietly(archive);
    fs_util::remove_quietly(&checksum::sidecar_path(archive));
}
