//! Backup service
//!
//! The operational surface shared by the CLI, the HTTP API and the
//! scheduler. One service owns one database handle and one operation
//! lock: a backup and a restore never run against it at the same time.
//!
//! Blocking work (dumping, packaging, extraction, applying rows) runs on
//! the blocking pool; cloud uploads run on the async runtime after the
//! lock is released.
//!
//! A data directory belongs to one process. `open` therefore treats any
//! record still `pending` or `in_progress` as left behind by a process
//! that died, fails it and clears its work files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backup::{
    backup_name, checksum, collect_upload_files, is_archive_file,
    partial_path, remove_leftovers, unique_archive_path, BackupError, BackupPipeline,
    BackupResult, ARCHIVE_EXTENSION, MANUAL_BACKUP_PREFIX, SAFETY_BACKUP_PREFIX,
};
use crate::cloud::{
    adapter_from_config, CloudError, CloudResult, CloudSyncAdapter, DriveStatus,
    GoogleDriveProvider, RemoteBackup, TokenStore,
};
use crate::config::BackupConfig;
use crate::database::Database;
use crate::lock::{OperationKind, OperationLock, RunControl};
use crate::observability::{log_event, Event, MetricsRegistry, ObservationScope};
use crate::records::{
    remove_archive_files, BackupRecord, BackupRecordManager, BackupStatus, BackupType, NewBackup,
    RecordError, RecordFilter, RecordPage, RecordStats,
};
use crate::restore::{
    ProgressCallback, RestoreError, RestoreExecutor, RestorePlan, RestoreResult, RestoreStatus,
    RestoreStrategy, RestoreSummary, RestoreValidator, ValidatedArchive, ValidationReport,
};
use crate::scope::{BackupScope, ScopeResolver, TableGroup};
use crate::store::{JsonFileStore, Store};

const PRE_UPDATE_PREFIX: &str = "pre-update-";

/// Request for a new backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBackupRequest {
    pub scope: BackupScope,
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,
    /// Defaults to a timestamped name for the backup type
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub sync_to_cloud: bool,
    #[serde(skip)]
    pub schedule_id: Option<Uuid>,
}

fn default_backup_type() -> BackupType {
    BackupType::Manual
}

impl CreateBackupRequest {
    pub fn new(scope: BackupScope) -> Self {
        Self {
            scope,
            backup_type: BackupType::Manual,
            name: None,
            description: None,
            created_by: None,
            sync_to_cloud: false,
            schedule_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOptions {
    pub strategy: RestoreStrategy,
    #[serde(default)]
    pub force_without_safety_backup: bool,
    /// A completed backup taken beforehand
    #[serde(default)]
    pub safety_backup_id: Option<Uuid>,
    /// Take a `pre_restore` backup of the target scope first
    #[serde(default)]
    pub create_safety_backup: bool,
    #[serde(default)]
    pub acknowledge_warnings: bool,
    /// Overrides the `.sha256` sidecar
    #[serde(default)]
    pub expected_checksum: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    /// Record whose archive is being restored; its restore fields are
    /// stamped with the outcome
    #[serde(skip)]
    pub source_backup_id: Option<Uuid>,
}

impl RestoreOptions {
    pub fn new(strategy: RestoreStrategy) -> Self {
        Self {
            strategy,
            force_without_safety_backup: false,
            safety_backup_id: None,
            create_safety_backup: false,
            acknowledge_warnings: false,
            expected_checksum: None,
            created_by: None,
            source_backup_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub status: RestoreStatus,
    pub report: ValidationReport,
    pub summary: RestoreSummary,
    /// Record of the safety backup taken for this restore
    pub safety_backup: Option<BackupRecord>,
    /// Source record after its restore fields were stamped
    pub source_backup: Option<BackupRecord>,
}

/// Archive of a recorded backup and the checksum stored when it was
/// written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArchive {
    pub backup_id: Uuid,
    pub path: PathBuf,
    pub checksum: Option<String>,
}

/// Remote archive copied into the backup directory
#[derive(Debug, Clone, Serialize)]
pub struct DownloadedBackup {
    pub remote: RemoteBackup,
    pub path: PathBuf,
    pub size: u64,
    /// Local record that was synced to this remote object, if any
    pub backup_id: Option<Uuid>,
    /// That record's checksum, used as the expected value on restore
    pub checksum: Option<String>,
}

/// What `recover_interrupted` cleaned up
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub interrupted: Vec<Uuid>,
    pub removed_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TablePreview {
    pub name: String,
    pub group: TableGroup,
    pub archive_rows: u64,
    /// `None` when the table does not exist live
    pub live_rows: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestorePreview {
    pub target_scope: BackupScope,
    pub report: ValidationReport,
    pub tables: Vec<TablePreview>,
    pub files_to_restore: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStat {
    pub name: String,
    pub group: Option<TableGroup>,
    pub row_count: u64,
}

/// What a backup of a scope would contain right now
#[derive(Debug, Clone, Serialize)]
pub struct BackupStats {
    pub scope: BackupScope,
    pub tables: Vec<TableStat>,
    pub total_rows: u64,
    pub uploads_count: u64,
    pub uploads_size: u64,
}

/// Archive file found in the backup directory
#[derive(Debug, Clone, Serialize)]
pub struct DiskArchive {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub has_checksum: bool,
}

#[derive(Clone)]
pub struct BackupService {
    config: Arc<BackupConfig>,
    db: Arc<dyn Database>,
    resolver: ScopeResolver,
    records: BackupRecordManager,
    cloud: Option<CloudSyncAdapter>,
    drive: Option<Arc<GoogleDriveProvider>>,
    lock: OperationLock,
    metrics: Arc<MetricsRegistry>,
}

impl BackupService {
    pub fn new(
        config: BackupConfig,
        db: Arc<dyn Database>,
        store: Arc<dyn Store<BackupRecord>>,
    ) -> BackupResult<Self> {
        let resolver = ScopeResolver::new(config.scopes.clone())?;
        let records =
            BackupRecordManager::new(store, config.app_version.clone(), config.schema_version.clone());
        Ok(Self {
            config: Arc::new(config),
            db,
            resolver,
            records,
            cloud: None,
            drive: None,
            lock: OperationLock::new(),
            metrics: Arc::new(MetricsRegistry::new()),
        })
    }

    /// Service backed by the JSON record store and the configured cloud
    /// provider. Runs `recover_interrupted` before returning.
    pub fn open(config: BackupConfig, db: Arc<dyn Database>) -> BackupResult<Self> {
        let store = JsonFileStore::<BackupRecord>::open(config.records_path())
            .map_err(|e| BackupError::record(RecordError::Store(e)))?;
        let cloud = adapter_from_config(&config).unwrap_or_else(|e| {
            log_cloud_setup_error(&e);
            None
        });
        let drive = if config.cloud.google_drive.is_configured() {
            GoogleDriveProvider::new(
                config.cloud.google_drive.clone(),
                TokenStore::new(config.token_path()),
            )
            .map(Arc::new)
            .map_err(|e| log_cloud_setup_error(&e))
            .ok()
        } else {
            None
        };

        let service = Self::new(config, db, Arc::new(store))?
            .with_cloud(cloud)
            .with_google_drive(drive);
        service.recover_interrupted()?;
        Ok(service)
    }

    pub fn with_cloud(mut self, cloud: Option<CloudSyncAdapter>) -> Self {
        self.cloud = cloud;
        self
    }

    /// Drive client used for the OAuth connect flow, independent of which
    /// provider cloud sync uses
    pub fn with_google_drive(mut self, drive: Option<Arc<GoogleDriveProvider>>) -> Self {
        self.drive = drive;
        self
    }

    /// Fail records left `pending` or `in_progress` and remove staging,
    /// restore and partial files from the backup directory.
    ///
    /// Refused while this service has an operation running.
    pub fn recover_interrupted(&self) -> BackupResult<RecoveryReport> {
        let _guard = self
            .lock
            .try_acquire(OperationKind::Backup, "recover interrupted")
            .map_err(|active| BackupError::concurrent_operation(&active))?;

        let failed = self.records.fail_interrupted().map_err(BackupError::record)?;
        for record in &failed {
            log_event(
                Event::InterruptedBackupRecovered,
                &[("id", &record.id.to_string()), ("name", &record.name)],
            );
        }
        let removed = remove_leftovers(&self.config.backup_dir)?;
        for path in &removed {
            log_event(
                Event::InterruptedBackupRecovered,
                &[("path", &path.display().to_string())],
            );
        }

        Ok(RecoveryReport {
            interrupted: failed.iter().map(|r| r.id).collect(),
            removed_paths: removed.iter().map(|p| p.display().to_string()).collect(),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn records(&self) -> &BackupRecordManager {
        &self.records
    }

    pub fn lock(&self) -> &OperationLock {
        &self.lock
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Run a backup. Fails with a concurrent-operation error while another
    /// backup or restore holds the lock. Cloud sync, when requested, runs
    /// after the archive is complete and never fails the backup.
    pub async fn create_backup(
        &self,
        request: CreateBackupRequest,
        control: RunControl,
    ) -> BackupResult<BackupRecord> {
        let name = request
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_name(request.backup_type, Utc::now()));

        let guard = self
            .lock
            .try_acquire(OperationKind::Backup, &name)
            .map_err(|active| {
                self.reject_concurrent(OperationKind::Backup, &active.to_string());
                BackupError::concurrent_operation(&active)
            })?;

        let new = NewBackup {
            backup_type: request.backup_type,
            scope: request.scope,
            name,
            description: request.description,
            created_by: request.created_by,
            schedule_id: request.schedule_id,
        };
        let record = self.run_backup_locked(new, control).await;
        drop(guard);

        let record = record?;
        if request.sync_to_cloud {
            Ok(self.sync_record(record).await)
        } else {
            Ok(record)
        }
    }

    /// Caller must hold the operation lock
    async fn run_backup_locked(
        &self,
        new: NewBackup,
        control: RunControl,
    ) -> BackupResult<BackupRecord> {
        self.metrics.backup_started();
        let observation = ObservationScope::with_fields(
            "BACKUP",
            &[
                ("scope", new.scope.as_str()),
                ("type", new.backup_type.as_str()),
                ("name", &new.name),
            ],
        );

        let record = self.records.begin(new).map_err(BackupError::record)?;
        let record = self.records.start(record.id).map_err(BackupError::record)?;

        let config = Arc::clone(&self.config);
        let db = Arc::clone(&self.db);
        let resolver = self.resolver.clone();
        let (id, name, scope, created_at) =
            (record.id, record.name.clone(), record.scope, record.created_at);

        let result = tokio::task::spawn_blocking(move || {
            let pipeline = BackupPipeline::new(&config, db.as_source(), &resolver);
            let plan = pipeline.plan(id, &name, scope, created_at)?;
            pipeline.run(&plan, &control)
        })
        .await
        .map_err(|e| BackupError::task_failed(format!("Backup task failed: {}", e)))
        .and_then(|r| r);

        let meta = match result {
            Ok(meta) => meta,
            Err(e) => {
                self.fail_record(id, &e);
                observation.fail(&e.to_string());
                return Err(e);
            }
        };

        match self.records.complete(id, &meta) {
            Ok(record) => {
                self.metrics.backup_completed(meta.record_count, meta.file_size);
                observation.complete_with_fields(&[
                    ("id", &id.to_string()),
                    ("tables", &meta.table_count.to_string()),
                    ("rows", &meta.record_count.to_string()),
                    ("bytes", &meta.file_size.to_string()),
                ]);
                Ok(record)
            }
            Err(e) => {
                // An archive without a completed record is not a backup
                remove_archive_files(Path::new(&meta.file_path));
                let err = BackupError::record(e);
                self.fail_record(id, &err);
                observation.fail(&err.to_string());
                Err(err)
            }
        }
    }

    fn fail_record(&self, id: Uuid, err: &BackupError) {
        self.metrics.backup_failed();
        if let Err(record_err) = self.records.fail(id, &err.to_string()) {
            log_event(
                Event::RecordTransition,
                &[
                    ("id", &id.to_string()),
                    ("to", "failed"),
                    ("error", &record_err.to_string()),
                ],
            );
        }
    }

    fn reject_concurrent(&self, requested: OperationKind, active: &str) {
        self.metrics.concurrent_rejected();
        log_event(
            Event::ConcurrentOperationRejected,
            &[("requested", &requested.to_string()), ("active", active)],
        );
    }

    /// Upload a record's archive and store the outcome on the record
    async fn sync_record(&self, record: BackupRecord) -> BackupRecord {
        let id = record.id;
        let (provider, outcome) = match (&self.cloud, record.file_path.as_deref()) {
            (Some(adapter), Some(path)) => {
                (adapter.provider_name(), adapter.sync(Path::new(path)).await)
            }
            (Some(adapter), None) => (
                adapter.provider_name(),
                Err(CloudError::Upload("record has no archive file".to_string())),
            ),
            (None, _) => (
                "none",
                Err(CloudError::NotConfigured(
                    "no cloud provider is configured".to_string(),
                )),
            ),
        };

        match &outcome {
            Ok(remote) => {
                self.metrics.cloud_sync(true);
                log_event(
                    Event::CloudSyncComplete,
                    &[("id", &id.to_string()), ("provider", provider), ("path", &remote.path)],
                );
            }
            Err(e) => {
                self.metrics.cloud_sync(false);
                log_event(
                    Event::CloudSyncFailed,
                    &[
                        ("id", &id.to_string()),
                        ("provider", provider),
                        ("code", e.code()),
                        ("reason", &e.to_string()),
                    ],
                );
            }
        }

        match self.records.record_cloud_sync(id, provider, outcome.as_ref()) {
            Ok(updated) => updated,
            Err(e) => {
                log_event(
                    Event::CloudSyncFailed,
                    &[("id", &id.to_string()), ("reason", &e.to_string())],
                );
                record
            }
        }
    }

    /// Retry cloud sync for a completed backup
    pub async fn sync_backup(&self, id: Uuid) -> BackupResult<BackupRecord> {
        let record = self.get_backup(id)?;
        if record.status != BackupStatus::Completed {
            return Err(BackupError::record(RecordError::InvalidTransition {
                id,
                from: record.status,
                to: BackupStatus::Completed,
            }));
        }
        Ok(self.sync_record(record).await)
    }

    /// Archive path and recorded checksum of a completed backup
    pub fn backup_archive(&self, id: Uuid) -> BackupResult<BackupArchive> {
        let record = self.get_backup(id)?;
        if record.status != BackupStatus::Completed {
            return Err(BackupError::record(RecordError::InvalidTransition {
                id,
                from: record.status,
                to: BackupStatus::Completed,
            }));
        }
        let path = record
            .file_path
            .ok_or_else(|| BackupError::not_found(format!("archive file of backup {}", id)))?;
        Ok(BackupArchive {
            backup_id: id,
            path: PathBuf::from(path),
            checksum: record.checksum,
        })
    }

    fn validator(&self) -> RestoreValidator {
        RestoreValidator::new(
            self.config.backup_dir.clone(),
            self.config.app_version.clone(),
            self.config.schema_version.clone(),
            self.db.list_tables().ok(),
        )
    }

    async fn inspect(
        &self,
        path: &Path,
        expected_checksum: Option<String>,
    ) -> RestoreResult<(ValidationReport, Option<ValidatedArchive>)> {
        let validator = self.validator();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || validator.inspect(&path, expected_checksum.as_deref()))
            .await
            .map_err(|e| RestoreError::task_failed(format!("Validation task failed: {}", e)))
    }

    /// Validate an archive without touching live state
    pub async fn validate_archive(
        &self,
        path: &Path,
        expected_checksum: Option<&str>,
    ) -> RestoreResult<ValidationReport> {
        let (report, _) = self
            .inspect(path, expected_checksum.map(str::to_string))
            .await?;
        Ok(report)
    }

    /// Validation plus archive and live row counts per target table
    pub async fn preview_restore(
        &self,
        path: &Path,
        target: BackupScope,
        expected_checksum: Option<&str>,
    ) -> RestoreResult<RestorePreview> {
        let (report, validated) = self
            .inspect(path, expected_checksum.map(str::to_string))
            .await?;

        let mut tables = Vec::new();
        let mut files_to_restore = 0;
        if let Some(archive) = &validated {
            for entry in archive.manifest.tables.iter().filter(|t| target.covers(t.group)) {
                tables.push(TablePreview {
                    name: entry.name().to_string(),
                    group: entry.group,
                    archive_rows: entry.row_count,
                    live_rows: self.db.count_rows(entry.name()).ok(),
                });
            }
            if target.includes_uploads() {
                files_to_restore = archive.manifest.uploads.file_count;
            }
        }

        Ok(RestorePreview {
            target_scope: target,
            report,
            tables,
            files_to_restore,
        })
    }

    /// Validate, optionally take a safety backup, then apply.
    ///
    /// Holds the operation lock throughout, including while the safety
    /// backup runs.
    pub async fn restore_from_archive(
        &self,
        path: &Path,
        target: BackupScope,
        options: RestoreOptions,
        control: RunControl,
        progress: Option<ProgressCallback>,
    ) -> RestoreResult<RestoreOutcome> {
        let label = path.display().to_string();
        let _guard = self
            .lock
            .try_acquire(OperationKind::Restore, &label)
            .map_err(|active| {
                self.reject_concurrent(OperationKind::Restore, &active.to_string());
                RestoreError::concurrent_operation(&active)
            })?;

        let observation = ObservationScope::with_fields(
            "RESTORE",
            &[
                ("archive", &label),
                ("scope", target.as_str()),
                ("strategy", options.strategy.as_str()),
            ],
        );
        let source_id = options.source_backup_id;
        let restored_by = options.created_by.clone();
        let result = self
            .restore_locked(path, target, options, control, progress)
            .await;

        let message = result.as_ref().err().map(|e| e.to_string());
        let source_backup = source_id.and_then(|id| {
            self.stamp_restore(id, restored_by.as_deref(), message.as_deref())
        });

        match result {
            Ok(mut outcome) => {
                outcome.source_backup = source_backup;
                self.metrics.restore_completed(outcome.summary.rows_applied);
                observation.complete_with_fields(&[
                    ("tables", &outcome.summary.tables_applied.to_string()),
                    ("rows", &outcome.summary.rows_applied.to_string()),
                    ("files", &outcome.summary.files_restored.to_string()),
                ]);
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.restore_failed();
                observation.fail(&e.to_string());
                Err(e)
            }
        }
    }

    async fn restore_locked(
        &self,
        path: &Path,
        target: BackupScope,
        options: RestoreOptions,
        control: RunControl,
        progress: Option<ProgressCallback>,
    ) -> RestoreResult<RestoreOutcome> {
        let (report, validated) = self.inspect(path, options.expected_checksum.clone()).await?;
        let archive = match (report.first_error(), validated) {
            (Some(err), _) => return Err(err),
            (None, Some(archive)) => archive,
            (None, None) => return Err(RestoreError::invalid_archive("Archive failed validation")),
        };
        if report.requires_acknowledgment() && !options.acknowledge_warnings {
            return Err(RestoreError::warnings_not_acknowledged(report.warnings.len()));
        }
        if !archive.manifest.scope.includes(target) {
            return Err(RestoreError::scope_not_in_archive(
                target.as_str(),
                archive.manifest.scope.as_str(),
            ));
        }

        let mut safety_backup = None;
        let mut safety_backup_verified = false;
        if options.strategy == RestoreStrategy::Replace {
            if options.create_safety_backup {
                let record = self.take_safety_backup(target, options.created_by.clone()).await?;
                safety_backup_verified = true;
                safety_backup = Some(record);
            } else if let Some(id) = options.safety_backup_id {
                safety_backup_verified = self.is_usable_backup(id);
                if !safety_backup_verified && !options.force_without_safety_backup {
                    return Err(RestoreError::safety_backup_required());
                }
            }
        }

        let db = Arc::clone(&self.db);
        let uploads_dir = self.config.uploads_dir.clone();
        let strategy = options.strategy;
        let force = options.force_without_safety_backup;
        let summary = tokio::task::spawn_blocking(move || {
            let plan = RestorePlan {
                archive: &archive,
                target,
                strategy,
                force_without_safety_backup: force,
                safety_backup_verified,
                uploads_dir,
            };
            RestoreExecutor::new(db.as_sink()).execute(&plan, &control, progress.as_ref())
        })
        .await
        .map_err(|e| RestoreError::task_failed(format!("Restore task failed: {}", e)))??;

        Ok(RestoreOutcome {
            status: RestoreStatus::Completed,
            report,
            summary,
            safety_backup,
            source_backup: None,
        })
    }

    /// Store a restore outcome on the source record. A missing record or
    /// store failure is logged; the restore result stands either way.
    fn stamp_restore(
        &self,
        id: Uuid,
        restored_by: Option<&str>,
        error: Option<&str>,
    ) -> Option<BackupRecord> {
        let outcome = match error {
            Some(message) => Err(message),
            None => Ok(()),
        };
        match self.records.record_restore(id, restored_by, outcome) {
            Ok(record) => Some(record),
            Err(e) => {
                log_event(
                    Event::RecordTransition,
                    &[
                        ("id", &id.to_string()),
                        ("to", "restored"),
                        ("error", &e.to_string()),
                    ],
                );
                None
            }
        }
    }

    /// Completed backup whose archive still exists
    fn is_usable_backup(&self, id: Uuid) -> bool {
        self.records
            .get(id)
            .map(|r| {
                r.status == BackupStatus::Completed
                    && r.file_path.as_deref().map_or(false, |p| Path::new(p).is_file())
            })
            .unwrap_or(false)
    }

    async fn take_safety_backup(
        &self,
        scope: BackupScope,
        created_by: Option<String>,
    ) -> RestoreResult<BackupRecord> {
        let mut new = NewBackup::new(
            BackupType::PreRestore,
            scope,
            backup_name(SAFETY_BACKUP_PREFIX, Utc::now()),
        );
        new.description = Some("Automatic backup before restore".to_string());
        new.created_by = created_by;

        let record = self
            .run_backup_locked(new, RunControl::new())
            .await
            .map_err(RestoreError::safety_backup_failed)?;
        log_event(
            Event::SafetyBackupCreated,
            &[
                ("id", &record.id.to_string()),
                ("path", record.file_path.as_deref().unwrap_or("-")),
            ],
        );
        Ok(record)
    }

    /// Take a `pre_restore` backup of `scope` on its own
    pub async fn create_safety_backup(
        &self,
        scope: BackupScope,
        created_by: Option<String>,
    ) -> BackupResult<BackupRecord> {
        let mut request = CreateBackupRequest::new(scope);
        request.backup_type = BackupType::PreRestore;
        request.description = Some("Manual pre-restore safety backup".to_string());
        request.created_by = created_by;
        self.create_backup(request, RunControl::new()).await
    }

    /// Tables, row counts and uploads a backup of `scope` would include
    pub fn backup_stats(&self, scope: BackupScope) -> BackupResult<BackupStats> {
        let resolved = self.resolver.resolve(scope);
        let mut tables = Vec::with_capacity(resolved.tables.len());
        for table in &resolved.tables {
            let row_count = self
                .db
                .count_rows(table)
                .map_err(|e| BackupError::table_dump(table, e))?;
            tables.push(TableStat {
                name: table.clone(),
                group: self.resolver.group_of(table),
                row_count,
            });
        }

        let (uploads_count, uploads_size) = if resolved.include_uploads {
            let files = collect_upload_files(&self.config.uploads_dir)?;
            (files.len() as u64, files.iter().map(|f| f.size).sum())
        } else {
            (0, 0)
        };

        Ok(BackupStats {
            scope,
            total_rows: tables.iter().map(|t| t.row_count).sum(),
            tables,
            uploads_count,
            uploads_size,
        })
    }

    pub fn list_backups(&self, filter: &RecordFilter) -> BackupResult<Vec<BackupRecord>> {
        self.records.list(filter).map_err(BackupError::record)
    }

    pub fn list_backup_page(&self, filter: &RecordFilter) -> BackupResult<RecordPage> {
        self.records.list_page(filter).map_err(BackupError::record)
    }

    pub fn get_backup(&self, id: Uuid) -> BackupResult<BackupRecord> {
        self.records.get(id).map_err(|e| match e {
            RecordError::NotFound(id) => BackupError::not_found(id),
            other => BackupError::record(other),
        })
    }

    pub fn delete_backup(&self, id: Uuid, delete_file: bool) -> BackupResult<BackupRecord> {
        self.records.delete(id, delete_file).map_err(|e| match e {
            RecordError::NotFound(id) => BackupError::not_found(id),
            other => BackupError::record(other),
        })
    }

    pub fn cleanup_failed(&self) -> BackupResult<u64> {
        self.records.cleanup_failed().map_err(BackupError::record)
    }

    pub fn record_stats(&self) -> BackupResult<RecordStats> {
        self.records.stats().map_err(BackupError::record)
    }

    /// Archive files in the backup directory, newest first
    pub fn list_disk_archives(&self) -> BackupResult<Vec<DiskArchive>> {
        let dir = &self.config.backup_dir;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut archives = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| BackupError::io_error_at_path(dir, e))? {
            let entry = entry.map_err(|e| BackupError::io_error_at_path(dir, e))?;
            let path: PathBuf = entry.path();
            if !path.is_file() || !is_archive_file(&path) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| BackupError::io_error_at_path(&path, e))?;
            archives.push(DiskArchive {
                name: entry.file_name().to_string_lossy().to_string(),
                path: path.display().to_string(),
                size: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
                has_checksum: checksum::sidecar_path(&path).is_file(),
            });
        }
        archives.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then(a.name.cmp(&b.name)));
        Ok(archives)
    }
}

// =============================================================================
// CLOUD AND GOOGLE DRIVE
// =============================================================================

impl BackupService {
    fn cloud(&self) -> CloudResult<&CloudSyncAdapter> {
        self.cloud.as_ref().ok_or_else(|| {
            CloudError::NotConfigured("no cloud provider is configured".to_string())
        })
    }

    pub fn cloud_provider_name(&self) -> Option<&'static str> {
        self.cloud.as_ref().map(CloudSyncAdapter::provider_name)
    }

    /// Archives held by the configured provider, newest first
    pub async fn list_cloud_backups(&self) -> CloudResult<Vec<RemoteBackup>> {
        self.cloud()?.provider().list().await
    }

    pub async fn test_cloud_connection(&self) -> CloudResult<()> {
        self.cloud()?.provider().test_connection().await
    }

    /// Copy a remote archive into the backup directory under a fresh
    /// name. The local record synced to that object, if one survives,
    /// supplies the expected checksum and the sidecar.
    pub async fn download_cloud_backup(&self, remote_id: &str) -> CloudResult<DownloadedBackup> {
        let provider = self.cloud()?.provider();
        let remote = provider
            .list()
            .await?
            .into_iter()
            .find(|r| r.id == remote_id)
            .ok_or_else(|| CloudError::NotFound(remote_id.to_string()))?;

        let dir = &self.config.backup_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CloudError::Request(format!("cannot create {}: {}", dir.display(), e)))?;
        let stem = remote.name.strip_suffix(ARCHIVE_EXTENSION).unwrap_or(&remote.name);
        let dest = unique_archive_path(dir, stem);
        let partial = partial_path(&dest);

        let size = match provider.download(&remote.id, &partial).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| CloudError::Request(format!("cannot move into {}: {}", dest.display(), e)))?;

        let synced = self
            .records
            .list(&RecordFilter::default())
            .ok()
            .and_then(|records| {
                records
                    .into_iter()
                    .find(|r| r.cloud_path.as_deref() == Some(remote.path.as_str()))
            });
        // Sidecar from the synced record
        if let Some(sum) = synced.as_ref().and_then(|r| r.checksum.as_deref()) {
            let sidecar = checksum::sidecar_path(&dest);
            tokio::fs::write(&sidecar, checksum::sidecar_contents(sum, &dest))
                .await
                .map_err(|e| {
                    CloudError::Request(format!("cannot write {}: {}", sidecar.display(), e))
                })?;
        }
        log_event(
            Event::CloudDownloaded,
            &[
                ("remote", &remote.path),
                ("path", &dest.display().to_string()),
                ("bytes", &size.to_string()),
            ],
        );
        Ok(DownloadedBackup {
            backup_id: synced.as_ref().map(|r| r.id),
            checksum: synced.and_then(|r| r.checksum),
            remote,
            path: dest,
            size,
        })
    }

    pub async fn delete_cloud_backup(&self, remote_id: &str) -> CloudResult<()> {
        let adapter = self.cloud()?;
        adapter.provider().delete(remote_id).await?;
        log_event(
            Event::CloudDeleted,
            &[("provider", adapter.provider_name()), ("remote", remote_id)],
        );
        Ok(())
    }

    fn google_drive(&self) -> CloudResult<&GoogleDriveProvider> {
        self.drive.as_deref().ok_or_else(|| {
            CloudError::NotConfigured(
                "GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET and GOOGLE_REDIRECT_URI are required"
                    .to_string(),
            )
        })
    }

    pub fn google_drive_status(&self) -> DriveStatus {
        match &self.drive {
            Some(drive) => drive.status(),
            None => DriveStatus::unconfigured(self.config.cloud.google_drive.folder_id.clone()),
        }
    }

    pub fn google_drive_auth_url(&self, state: Option<&str>) -> CloudResult<String> {
        Ok(self.google_drive()?.authorization_url(state))
    }

    /// Exchange an authorization code and store the tokens
    pub async fn connect_google_drive(&self, code: &str) -> CloudResult<DriveStatus> {
        let drive = self.google_drive()?;
        let tokens = drive.exchange_code(code).await?;
        log_event(
            Event::CloudConnected,
            &[
                ("provider", crate::cloud::google_drive::PROVIDER_NAME),
                ("expires_at", &tokens.expires_at.to_rfc3339()),
            ],
        );
        Ok(drive.status())
    }

    /// Forget stored tokens; `false` when none were stored
    pub fn disconnect_google_drive(&self) -> CloudResult<bool> {
        let removed = self.google_drive()?.disconnect();
        log_event(
            Event::CloudDisconnected,
            &[
                ("provider", crate::cloud::google_drive::PROVIDER_NAME),
                ("tokens_removed", if removed { "true" } else { "false" }),
            ],
        );
        Ok(removed)
    }
}

fn log_cloud_setup_error(e: &CloudError) {
    log_event(
        Event::CloudSyncFailed,
        &[("code", e.code()), ("reason", &e.to_string())],
    );
}

fn default_name(backup_type: BackupType, at: DateTime<Utc>) -> String {
    let prefix = match backup_type {
        BackupType::PreRestore => SAFETY_BACKUP_PREFIX,
        BackupType::PreUpdate => PRE_UPDATE_PREFIX,
        BackupType::Manual | BackupType::Scheduled => MANUAL_BACKUP_PREFIX,
    };
    backup_name(prefix, at)
}
