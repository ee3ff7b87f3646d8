//! Backup HTTP Routes
//!
//! Backup creation and records, archive validation and restore, cloud
//! copies, the Google Drive connection and schedule management. Mounted
//! under `/backup`.
//!
//! Archives are addressed either by backup id or by a bare file name
//! inside the backup directory; arbitrary server paths are refused. An
//! archive addressed by id is checked against the checksum on its record
//! unless the request supplies one.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backup::{BackupError, BackupErrorCode};
use crate::cloud::{CloudError, DriveStatus, RemoteBackup};
use crate::lock::RunControl;
use crate::observability::MetricsSnapshot;
use crate::records::{BackupRecord, BackupStatus, BackupType, RecordFilter, RecordStats};
use crate::restore::{RestoreError, RestoreErrorCode, RestoreProgress, ValidationReport};
use crate::schedule::{
    BackupSchedule, NewSchedule, ScheduleError, ScheduleRunResult, ScheduleRunner, ScheduleUpdate,
};
use crate::scope::BackupScope;
use crate::service::{
    BackupService, BackupStats, CreateBackupRequest, DiskArchive, DownloadedBackup,
    RestoreOptions, RestoreOutcome, RestorePreview,
};

// ==================
// Shared State
// ==================

/// Called after a restore has been applied, e.g. to persist the database
pub type RestoreHook = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

pub struct BackupState {
    service: BackupService,
    runner: ScheduleRunner,
    after_restore: Option<RestoreHook>,
}

impl BackupState {
    pub fn new(service: BackupService, runner: ScheduleRunner) -> Self {
        Self {
            service,
            runner,
            after_restore: None,
        }
    }

    pub fn with_restore_hook(mut self, hook: RestoreHook) -> Self {
        self.after_restore = Some(hook);
        self
    }

    pub fn service(&self) -> &BackupService {
        &self.service
    }

    /// Archive named by id or by file name in the backup directory
    fn resolve_archive(&self, archive: &ArchiveRef) -> Result<ResolvedArchive, ApiError> {
        if let Some(id) = archive.backup_id {
            let recorded = self.service.backup_archive(id).map_err(backup_error)?;
            if !recorded.path.is_file() {
                return Err(error_response(
                    StatusCode::NOT_FOUND,
                    "NEXUS_BACKUP_NOT_FOUND",
                    format!("Backup {} has no archive on disk", id),
                ));
            }
            return Ok(ResolvedArchive {
                path: recorded.path,
                checksum: recorded.checksum,
                backup_id: Some(id),
            });
        }

        let file = archive.file.as_deref().ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "NEXUS_HTTP_INVALID_REQUEST",
                "Either backup_id or file is required",
            )
        })?;
        let is_plain_name = !file.is_empty()
            && FsPath::new(file).file_name().map_or(false, |name| name == file)
            && file != "."
            && file != "..";
        if !is_plain_name {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "NEXUS_HTTP_INVALID_REQUEST",
                format!("'{}' is not a file name in the backup directory", file),
            ));
        }

        let path = self.service.config().backup_dir.join(file);
        if !path.is_file() {
            return Err(error_response(
                StatusCode::NOT_FOUND,
                "NEXUS_BACKUP_NOT_FOUND",
                format!("Archive {} not found", file),
            ));
        }
        Ok(ResolvedArchive {
            path,
            checksum: None,
            backup_id: None,
        })
    }

    fn after_restore(&self) -> Result<(), ApiError> {
        match &self.after_restore {
            Some(hook) => hook().map_err(|reason| {
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "NEXUS_HTTP_PERSIST_FAILED",
                    format!("Restore applied but could not be persisted: {}", reason),
                )
            }),
            None => Ok(()),
        }
    }
}

/// Archive on disk plus what its record says about it
struct ResolvedArchive {
    path: PathBuf,
    /// Checksum recorded when the backup completed
    checksum: Option<String>,
    backup_id: Option<Uuid>,
}

impl ResolvedArchive {
    /// The caller's checksum wins over the recorded one
    fn expected_checksum(&self, requested: Option<String>) -> Option<String> {
        requested.or_else(|| self.checksum.clone())
    }
}

// ==================
// Request/Response Types
// ==================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveRef {
    #[serde(default)]
    pub backup_id: Option<Uuid>,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(flatten)]
    pub archive: ArchiveRef,
    #[serde(default)]
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    #[serde(flatten)]
    pub archive: ArchiveRef,
    pub scope: BackupScope,
    #[serde(flatten)]
    pub options: RestoreOptions,
}

#[derive(Debug, Deserialize)]
pub struct RestorePreviewRequest {
    #[serde(flatten)]
    pub archive: ArchiveRef,
    pub scope: BackupScope,
    #[serde(default)]
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListBackupsQuery {
    #[serde(default)]
    pub status: Option<BackupStatus>,
    #[serde(default, rename = "type")]
    pub backup_type: Option<BackupType>,
    #[serde(default)]
    pub scope: Option<BackupScope>,
    #[serde(default)]
    pub schedule_id: Option<Uuid>,
    /// RFC 3339, inclusive
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteBackupQuery {
    #[serde(default)]
    pub delete_file: bool,
}

#[derive(Debug, Serialize)]
pub struct BackupListItem {
    #[serde(flatten)]
    pub record: BackupRecord,
    /// Whether the archive is still on disk
    pub file_exists: bool,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Serialize)]
pub struct BackupsListResponse {
    pub backups: Vec<BackupListItem>,
    /// Matching records across all pages
    pub total: usize,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize)]
pub struct RemoteRef {
    pub remote_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CloudRestoreRequest {
    pub remote_id: String,
    pub scope: BackupScope,
    #[serde(flatten)]
    pub options: RestoreOptions,
}

#[derive(Debug, Serialize)]
pub struct CloudRestoreResponse {
    pub downloaded: DownloadedBackup,
    #[serde(flatten)]
    pub outcome: RestoreOutcome,
}

#[derive(Debug, Serialize)]
pub struct CloudListResponse {
    pub provider: Option<&'static str>,
    pub backups: Vec<RemoteBackup>,
}

#[derive(Debug, Serialize)]
pub struct CloudStatusResponse {
    pub provider: Option<&'static str>,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthUrlQuery {
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthUrlResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeCodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub disconnected: bool,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<RestoreProgress>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, error_code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: status.as_u16(),
            error_code: error_code.to_string(),
            table: None,
            progress: None,
        }),
    )
}

fn backup_error(e: BackupError) -> ApiError {
    let status = match e.code() {
        BackupErrorCode::ConcurrentOperation | BackupErrorCode::Cancelled => StatusCode::CONFLICT,
        BackupErrorCode::InvalidScope => StatusCode::BAD_REQUEST,
        BackupErrorCode::NotFound => StatusCode::NOT_FOUND,
        BackupErrorCode::TableDump
        | BackupErrorCode::ArchiveWrite
        | BackupErrorCode::Record
        | BackupErrorCode::Io => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let (status, Json(mut body)) = error_response(status, e.code().as_str(), e.to_string());
    body.table = e.table().map(str::to_string);
    (status, Json(body))
}

fn restore_error(e: RestoreError) -> ApiError {
    let status = match e.code() {
        RestoreErrorCode::ConcurrentOperation | RestoreErrorCode::Cancelled => {
            StatusCode::CONFLICT
        }
        RestoreErrorCode::SafetyBackupRequired | RestoreErrorCode::ScopeNotInArchive => {
            StatusCode::BAD_REQUEST
        }
        RestoreErrorCode::ChecksumMismatch
        | RestoreErrorCode::InvalidArchive
        | RestoreErrorCode::WarningsNotAcknowledged => StatusCode::UNPROCESSABLE_ENTITY,
        RestoreErrorCode::ForeignKeyViolation
        | RestoreErrorCode::TableFailed
        | RestoreErrorCode::Io => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let (status, Json(mut body)) = error_response(status, e.code().as_str(), e.to_string());
    body.table = e.table().map(str::to_string);
    body.progress = e.progress().cloned();
    (status, Json(body))
}

fn cloud_error(e: CloudError) -> ApiError {
    let status = match &e {
        CloudError::Auth(_) => StatusCode::UNAUTHORIZED,
        CloudError::NotConfigured(_) => StatusCode::BAD_REQUEST,
        CloudError::NotFound(_) => StatusCode::NOT_FOUND,
        CloudError::Upload(_) | CloudError::Request(_) => StatusCode::BAD_GATEWAY,
    };
    error_response(status, e.code(), e.to_string())
}

fn schedule_error(e: ScheduleError) -> ApiError {
    let status = match &e {
        ScheduleError::NotFound(_) => StatusCode::NOT_FOUND,
        ScheduleError::InvalidCron { .. } | ScheduleError::Invalid(_) => StatusCode::BAD_REQUEST,
        ScheduleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, "NEXUS_SCHEDULE_ERROR", e.to_string())
}

// ==================
// Backup Routes
// ==================

pub fn backup_routes(state: Arc<BackupState>) -> Router {
    Router::new()
        // Backup management
        .route("/", post(create_backup_handler).get(list_backups_handler))
        .route("/stats", get(record_stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/preview/:scope", get(backup_preview_handler))
        .route("/disk-files", get(disk_files_handler))
        .route("/cleanup-failed", post(cleanup_failed_handler))
        // Restore operations
        .route("/validate", post(validate_handler))
        .route("/restore", post(restore_handler))
        .route("/restore/preview", post(restore_preview_handler))
        // Cloud copies
        .route("/cloud", get(list_cloud_handler))
        .route("/cloud/test", post(test_cloud_handler))
        .route("/cloud/download", post(download_cloud_handler))
        .route("/cloud/delete", post(delete_cloud_handler))
        .route("/cloud/restore", post(restore_cloud_handler))
        // Google Drive connection
        .route("/google-drive/status", get(drive_status_handler))
        .route("/google-drive/auth-url", get(drive_auth_url_handler))
        .route("/google-drive/exchange", post(drive_exchange_handler))
        .route("/google-drive/disconnect", post(drive_disconnect_handler))
        // Schedule management
        .route(
            "/schedules",
            get(list_schedules_handler).post(create_schedule_handler),
        )
        .route("/schedules/run", post(run_schedules_handler))
        .route(
            "/schedules/:id",
            patch(update_schedule_handler).delete(delete_schedule_handler),
        )
        // Single backup
        .route("/:id", get(get_backup_handler).delete(delete_backup_handler))
        .route("/:id/sync", post(sync_backup_handler))
        .with_state(state)
}

// ==================
// Backup Management Handlers
// ==================

async fn create_backup_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<CreateBackupRequest>,
) -> Result<(StatusCode, Json<BackupRecord>), ApiError> {
    let record = state
        .service
        .create_backup(request, RunControl::new())
        .await
        .map_err(backup_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_backups_handler(
    State(state): State<Arc<BackupState>>,
    Query(query): Query<ListBackupsQuery>,
) -> Result<Json<BackupsListResponse>, ApiError> {
    let filter = RecordFilter {
        status: query.status,
        backup_type: query.backup_type,
        scope: query.scope,
        schedule_id: query.schedule_id,
        created_after: query.start_date,
        created_before: query.end_date,
        page: query.page,
        limit: query.limit,
    };
    let page = state.service.list_backup_page(&filter).map_err(backup_error)?;
    let backups = page
        .records
        .into_iter()
        .map(|record| BackupListItem {
            file_exists: record
                .file_path
                .as_deref()
                .map_or(false, |p| FsPath::new(p).is_file()),
            record,
        })
        .collect();
    Ok(Json(BackupsListResponse {
        backups,
        total: page.total,
        pagination: Pagination {
            page: page.page,
            limit: page.limit,
            total: page.total,
            total_pages: page.total_pages,
        },
    }))
}

async fn get_backup_handler(
    State(state): State<Arc<BackupState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupRecord>, ApiError> {
    state.service.get_backup(id).map(Json).map_err(backup_error)
}

async fn delete_backup_handler(
    State(state): State<Arc<BackupState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteBackupQuery>,
) -> Result<Json<BackupRecord>, ApiError> {
    state
        .service
        .delete_backup(id, query.delete_file)
        .map(Json)
        .map_err(backup_error)
}

async fn sync_backup_handler(
    State(state): State<Arc<BackupState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupRecord>, ApiError> {
    state
        .service
        .sync_backup(id)
        .await
        .map(Json)
        .map_err(backup_error)
}

async fn record_stats_handler(
    State(state): State<Arc<BackupState>>,
) -> Result<Json<RecordStats>, ApiError> {
    state.service.record_stats().map(Json).map_err(backup_error)
}

async fn metrics_handler(State(state): State<Arc<BackupState>>) -> Json<MetricsSnapshot> {
    Json(state.service.metrics().snapshot())
}

async fn backup_preview_handler(
    State(state): State<Arc<BackupState>>,
    Path(scope): Path<String>,
) -> Result<Json<BackupStats>, ApiError> {
    let scope: BackupScope = scope.parse().map_err(backup_error)?;
    state.service.backup_stats(scope).map(Json).map_err(backup_error)
}

async fn disk_files_handler(
    State(state): State<Arc<BackupState>>,
) -> Result<Json<Vec<DiskArchive>>, ApiError> {
    state
        .service
        .list_disk_archives()
        .map(Json)
        .map_err(backup_error)
}

async fn cleanup_failed_handler(
    State(state): State<Arc<BackupState>>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let deleted = state.service.cleanup_failed().map_err(backup_error)?;
    Ok(Json(CleanupResponse { deleted }))
}

// ==================
// Restore Handlers
// ==================

async fn validate_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<ValidationReport>, ApiError> {
    let archive = state.resolve_archive(&request.archive)?;
    let expected = archive.expected_checksum(request.expected_checksum);
    state
        .service
        .validate_archive(&archive.path, expected.as_deref())
        .await
        .map(Json)
        .map_err(restore_error)
}

async fn restore_preview_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<RestorePreviewRequest>,
) -> Result<Json<RestorePreview>, ApiError> {
    let archive = state.resolve_archive(&request.archive)?;
    let expected = archive.expected_checksum(request.expected_checksum);
    state
        .service
        .preview_restore(&archive.path, request.scope, expected.as_deref())
        .await
        .map(Json)
        .map_err(restore_error)
}

async fn restore_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<RestoreOutcome>, ApiError> {
    let archive = state.resolve_archive(&request.archive)?;
    let mut options = request.options;
    options.expected_checksum = archive.expected_checksum(options.expected_checksum.take());
    options.source_backup_id = archive.backup_id;

    let outcome = state
        .service
        .restore_from_archive(&archive.path, request.scope, options, RunControl::new(), None)
        .await
        .map_err(restore_error)?;
    state.after_restore()?;
    Ok(Json(outcome))
}

// ==================
// Cloud Handlers
// ==================

async fn list_cloud_handler(
    State(state): State<Arc<BackupState>>,
) -> Result<Json<CloudListResponse>, ApiError> {
    let backups = state
        .service
        .list_cloud_backups()
        .await
        .map_err(cloud_error)?;
    Ok(Json(CloudListResponse {
        provider: state.service.cloud_provider_name(),
        backups,
    }))
}

async fn test_cloud_handler(
    State(state): State<Arc<BackupState>>,
) -> Result<Json<CloudStatusResponse>, ApiError> {
    state
        .service
        .test_cloud_connection()
        .await
        .map_err(cloud_error)?;
    Ok(Json(CloudStatusResponse {
        provider: state.service.cloud_provider_name(),
        connected: true,
    }))
}

async fn download_cloud_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<RemoteRef>,
) -> Result<Json<DownloadedBackup>, ApiError> {
    state
        .service
        .download_cloud_backup(&request.remote_id)
        .await
        .map(Json)
        .map_err(cloud_error)
}

async fn delete_cloud_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<RemoteRef>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state
        .service
        .delete_cloud_backup(&request.remote_id)
        .await
        .map_err(cloud_error)?;
    Ok(Json(DeletedResponse { deleted: true }))
}

/// Download a remote archive, then restore it like a local one
async fn restore_cloud_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<CloudRestoreRequest>,
) -> Result<Json<CloudRestoreResponse>, ApiError> {
    let downloaded = state
        .service
        .download_cloud_backup(&request.remote_id)
        .await
        .map_err(cloud_error)?;

    let mut options = request.options;
    options.expected_checksum = options
        .expected_checksum
        .take()
        .or_else(|| downloaded.checksum.clone());
    options.source_backup_id = downloaded.backup_id;

    let outcome = state
        .service
        .restore_from_archive(&downloaded.path, request.scope, options, RunControl::new(), None)
        .await
        .map_err(restore_error)?;
    state.after_restore()?;
    Ok(Json(CloudRestoreResponse {
        downloaded,
        outcome,
    }))
}

// ==================
// Google Drive Handlers
// ==================

async fn drive_status_handler(State(state): State<Arc<BackupState>>) -> Json<DriveStatus> {
    Json(state.service.google_drive_status())
}

async fn drive_auth_url_handler(
    State(state): State<Arc<BackupState>>,
    Query(query): Query<AuthUrlQuery>,
) -> Result<Json<AuthUrlResponse>, ApiError> {
    let url = state
        .service
        .google_drive_auth_url(query.state.as_deref())
        .map_err(cloud_error)?;
    Ok(Json(AuthUrlResponse { url }))
}

async fn drive_exchange_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<ExchangeCodeRequest>,
) -> Result<Json<DriveStatus>, ApiError> {
    if request.code.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "NEXUS_HTTP_INVALID_REQUEST",
            "Authorization code is required",
        ));
    }
    state
        .service
        .connect_google_drive(&request.code)
        .await
        .map(Json)
        .map_err(cloud_error)
}

async fn drive_disconnect_handler(
    State(state): State<Arc<BackupState>>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let disconnected = state
        .service
        .disconnect_google_drive()
        .map_err(cloud_error)?;
    Ok(Json(DisconnectResponse { disconnected }))
}

// ==================
// Schedule Handlers
// ==================

async fn list_schedules_handler(
    State(state): State<Arc<BackupState>>,
) -> Result<Json<Vec<BackupSchedule>>, ApiError> {
    state
        .runner
        .schedules()
        .list()
        .map(Json)
        .map_err(schedule_error)
}

async fn create_schedule_handler(
    State(state): State<Arc<BackupState>>,
    Json(request): Json<NewSchedule>,
) -> Result<(StatusCode, Json<BackupSchedule>), ApiError> {
    let schedule = state
        .runner
        .schedules()
        .create(request, Utc::now())
        .map_err(schedule_error)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn update_schedule_handler(
    State(state): State<Arc<BackupState>>,
    Path(id): Path<Uuid>,
    Json(update): Json<ScheduleUpdate>,
) -> Result<Json<BackupSchedule>, ApiError> {
    state
        .runner
        .schedules()
        .update(id, update, Utc::now())
        .map(Json)
        .map_err(schedule_error)
}

async fn delete_schedule_handler(
    State(state): State<Arc<BackupState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupSchedule>, ApiError> {
    state
        .runner
        .schedules()
        .delete(id)
        .map(Json)
        .map_err(schedule_error)
}

async fn run_schedules_handler(
    State(state): State<Arc<BackupState>>,
) -> Result<Json<Vec<ScheduleRunResult>>, ApiError> {
    state
        .runner
        .tick(Utc::now())
        .await
        .map(Json)
        .map_err(schedule_error)
}
