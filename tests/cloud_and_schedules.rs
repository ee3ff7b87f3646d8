//! Cloud sync and scheduled backup tests

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use common::fixture;
use nexus_backup::cloud::{
    CloudError, CloudProvider, CloudResult, CloudSyncAdapter, GoogleDriveProvider, OAuthTokens,
    RemoteBackup, RemoteObject, TokenStore,
};
use nexus_backup::config::GoogleDriveConfig;
use nexus_backup::lock::RunControl;
use nexus_backup::records::{BackupStatus, BackupType, RecordFilter};
use nexus_backup::schedule::{BackupSchedule, NewSchedule, ScheduleManager, ScheduleRunner};
use nexus_backup::scope::BackupScope;
use nexus_backup::restore::RestoreStrategy;
use nexus_backup::service::{CreateBackupRequest, RestoreOptions};
use nexus_backup::store::MemoryStore;

/// Keeps every upload in memory and counts them
#[derive(Default)]
struct RecordingProvider {
    uploads: AtomicUsize,
    objects: Mutex<BTreeMap<String, (String, Vec<u8>)>>,
}

#[async_trait]
impl CloudProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn upload(&self, path: &Path, remote_name: &str) -> CloudResult<RemoteObject> {
        let bytes = std::fs::read(path).unwrap();
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let id = format!("obj-{}", remote_name);
        self.objects
            .lock()
            .unwrap()
            .insert(id.clone(), (remote_name.to_string(), bytes));
        Ok(RemoteObject {
            provider: "recording".to_string(),
            id,
            path: format!("remote/{}", remote_name),
        })
    }

    async fn list(&self) -> CloudResult<Vec<RemoteBackup>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (name, bytes))| RemoteBackup {
                id: id.clone(),
                name: name.clone(),
                path: format!("remote/{}", name),
                size: Some(bytes.len() as u64),
                created_at: None,
            })
            .collect())
    }

    async fn download(&self, remote_id: &str, dest: &Path) -> CloudResult<u64> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(remote_id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| CloudError::NotFound(remote_id.to_string()))?;
        std::fs::write(dest, &bytes).unwrap();
        Ok(bytes.len() as u64)
    }

    async fn delete(&self, remote_id: &str) -> CloudResult<()> {
        match self.objects.lock().unwrap().remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound(remote_id.to_string())),
        }
    }
}

fn expired_drive(dir: &Path) -> GoogleDriveProvider {
    let tokens = TokenStore::new(dir.join("drive-token.json"));
    tokens
        .save(&OAuthTokens {
            access_token: "stale".to_string(),
            refresh_token: None,
            expires_at: Utc::now() - Duration::hours(1),
            token_type: Some("Bearer".to_string()),
            scope: None,
        })
        .unwrap();

    let config = GoogleDriveConfig {
        client_id: Some("client".to_string()),
        client_secret: Some("secret".to_string()),
        redirect_uri: Some("http://localhost/callback".to_string()),
        // Never contacted: there is no refresh token to send
        token_url: "http://127.0.0.1:9/token".to_string(),
        ..GoogleDriveConfig::default()
    };
    GoogleDriveProvider::new(config, tokens).unwrap()
}

fn sync_request(scope: BackupScope) -> CreateBackupRequest {
    let mut request = CreateBackupRequest::new(scope);
    request.sync_to_cloud = true;
    request
}

// =============================================================================
// CLOUD SYNC
// =============================================================================

#[tokio::test]
async fn test_failed_cloud_sync_keeps_backup_completed() {
    let f = fixture();
    let drive = expired_drive(f.root());
    let service = f.service.clone().with_cloud(Some(CloudSyncAdapter::new(
        Arc::new(drive),
        StdDuration::from_secs(5),
    )));

    let record = service
        .create_backup(sync_request(BackupScope::Settings), RunControl::new())
        .await
        .unwrap();

    assert_eq!(record.status, BackupStatus::Completed);
    assert!(!record.is_cloud_synced);
    assert_eq!(record.cloud_provider.as_deref(), Some("google_drive"));
    assert!(record
        .cloud_sync_error
        .as_deref()
        .unwrap()
        .starts_with("NEXUS_CLOUD_AUTH"));
    assert!(Path::new(record.file_path.as_deref().unwrap()).is_file());

    let stored = service.get_backup(record.id).unwrap();
    assert_eq!(stored.status, BackupStatus::Completed);
    assert_eq!(service.metrics().snapshot().cloud_syncs_failed, 1);
}

#[tokio::test]
async fn test_retry_sync_after_failure() {
    let f = fixture();
    let failing = f.service.clone().with_cloud(Some(CloudSyncAdapter::new(
        Arc::new(expired_drive(f.root())),
        StdDuration::from_secs(5),
    )));
    let record = failing
        .create_backup(sync_request(BackupScope::Settings), RunControl::new())
        .await
        .unwrap();
    assert!(record.cloud_sync_error.is_some());

    let provider = Arc::new(RecordingProvider::default());
    let working = f.service.clone().with_cloud(Some(CloudSyncAdapter::new(
        provider.clone(),
        StdDuration::from_secs(5),
    )));
    let synced = working.sync_backup(record.id).await.unwrap();

    assert_eq!(provider.uploads.load(Ordering::SeqCst), 1);
    assert!(synced.is_cloud_synced);
    assert!(synced.cloud_synced_at.is_some());
    assert!(synced.cloud_sync_error.is_none());
    assert_eq!(synced.cloud_provider.as_deref(), Some("recording"));
    assert!(synced.cloud_path.as_deref().unwrap().starts_with("remote/"));
}

#[tokio::test]
async fn test_sync_refused_for_failed_backup() {
    let f = fixture();
    let control = RunControl::new();
    control.cancel().unwrap();
    f.service
        .create_backup(CreateBackupRequest::new(BackupScope::Settings), control)
        .await
        .unwrap_err();
    let failed = f.service.list_backups(&RecordFilter::default()).unwrap()[0].clone();

    assert!(f.service.sync_backup(failed.id).await.is_err());
}

#[tokio::test]
async fn test_restore_from_cloud_copy_after_local_archive_is_lost() {
    let f = fixture();
    let provider = Arc::new(RecordingProvider::default());
    let service = f.service.clone().with_cloud(Some(CloudSyncAdapter::new(
        provider.clone(),
        StdDuration::from_secs(5),
    )));
    let record = service
        .create_backup(sync_request(BackupScope::Settings), RunControl::new())
        .await
        .unwrap();
    assert!(record.is_cloud_synced);
    let local = Path::new(record.file_path.as_deref().unwrap()).to_path_buf();
    std::fs::remove_file(&local).unwrap();

    let remote = service.list_cloud_backups().await.unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(Some(remote[0].path.as_str()), record.cloud_path.as_deref());

    let downloaded = service.download_cloud_backup(&remote[0].id).await.unwrap();
    assert!(downloaded.path.is_file());
    assert_eq!(downloaded.backup_id, Some(record.id));
    assert_eq!(downloaded.checksum, record.checksum);

    let mut options = RestoreOptions::new(RestoreStrategy::Merge);
    options.expected_checksum = downloaded.checksum.clone();
    options.source_backup_id = downloaded.backup_id;
    options.created_by = Some("ops".to_string());
    let outcome = service
        .restore_from_archive(
            &downloaded.path,
            BackupScope::Settings,
            options,
            RunControl::new(),
            None,
        )
        .await
        .unwrap();
    assert!(outcome.report.valid);

    let source = service.get_backup(record.id).unwrap();
    assert_eq!(source.restore_count, 1);
    assert_eq!(source.restored_by.as_deref(), Some("ops"));
}

#[tokio::test]
async fn test_cloud_delete_and_missing_objects() {
    let f = fixture();
    let provider = Arc::new(RecordingProvider::default());
    let service = f.service.clone().with_cloud(Some(CloudSyncAdapter::new(
        provider.clone(),
        StdDuration::from_secs(5),
    )));
    service
        .create_backup(sync_request(BackupScope::Settings), RunControl::new())
        .await
        .unwrap();
    let remote = service.list_cloud_backups().await.unwrap();
    assert!(service.test_cloud_connection().await.is_ok());

    service.delete_cloud_backup(&remote[0].id).await.unwrap();
    assert!(service.list_cloud_backups().await.unwrap().is_empty());
    assert!(matches!(
        service.download_cloud_backup(&remote[0].id).await,
        Err(CloudError::NotFound(_))
    ));
    assert!(matches!(
        f.service.list_cloud_backups().await,
        Err(CloudError::NotConfigured(_))
    ));
}

// =============================================================================
// SCHEDULES
// =============================================================================

fn runner(service: nexus_backup::service::BackupService) -> ScheduleRunner {
    ScheduleRunner::new(
        service,
        ScheduleManager::new(Arc::new(MemoryStore::<BackupSchedule>::new())),
    )
}

#[tokio::test]
async fn test_tick_runs_due_schedules() {
    let f = fixture();
    let runner = runner(f.service.clone());
    let created = Utc::now();
    let hourly = runner
        .schedules()
        .create(NewSchedule::new("hourly", "0 * * * *", BackupScope::Settings), created)
        .unwrap();
    let mut paused = NewSchedule::new("paused", "0 * * * *", BackupScope::Full);
    paused.is_enabled = false;
    runner.schedules().create(paused, created).unwrap();

    let results = runner.tick(created + Duration::hours(2)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].schedule_id, hourly.id);
    assert!(results[0].error.is_none());

    let record = f.service.get_backup(results[0].backup_id.unwrap()).unwrap();
    assert_eq!(record.backup_type, BackupType::Scheduled);
    assert_eq!(record.schedule_id, Some(hourly.id));
    assert_eq!(record.status, BackupStatus::Completed);

    let hourly = runner.schedules().get(hourly.id).unwrap();
    assert_eq!(hourly.success_count, 1);
    assert!(hourly.next_run_at.unwrap() > created + Duration::hours(2));

    // Nothing is due again until the next hour
    assert!(runner
        .tick(created + Duration::hours(2))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_failed_run_is_counted() {
    let f = fixture();
    let runner = runner(f.service.clone());
    let created = Utc::now();
    let schedule = runner
        .schedules()
        .create(NewSchedule::new("hourly", "0 * * * *", BackupScope::Settings), created)
        .unwrap();

    let _held = f
        .service
        .lock()
        .try_acquire(nexus_backup::lock::OperationKind::Restore, "maintenance")
        .unwrap();
    let results = runner.tick(created + Duration::hours(2)).await.unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].backup_id.is_none());
    assert!(results[0].error.is_some());
    let schedule = runner.schedules().get(schedule.id).unwrap();
    assert_eq!(schedule.failure_count, 1);
    assert_eq!(schedule.success_count, 0);
}

#[tokio::test]
async fn test_retention_only_touches_its_own_schedule() {
    let f = fixture();
    let runner = runner(f.service.clone());
    let created = Utc::now();

    let mut weekly = NewSchedule::new("weekly", "0 * * * *", BackupScope::Settings);
    weekly.retention_days = 7;
    let weekly = runner.schedules().create(weekly, created).unwrap();
    let mut monthly = NewSchedule::new("monthly", "0 * * * *", BackupScope::Settings);
    monthly.retention_days = 7;
    let monthly = runner.schedules().create(monthly, created).unwrap();

    let results = runner.tick(created + Duration::hours(2)).await.unwrap();
    assert_eq!(results.len(), 2);
    let manual = f
        .service
        .create_backup(CreateBackupRequest::new(BackupScope::Settings), RunControl::new())
        .await
        .unwrap();

    let weekly_backup = results
        .iter()
        .find(|r| r.schedule_id == weekly.id)
        .and_then(|r| r.backup_id)
        .unwrap();
    let monthly_backup = results
        .iter()
        .find(|r| r.schedule_id == monthly.id)
        .and_then(|r| r.backup_id)
        .unwrap();
    let weekly_path = f.service.get_backup(weekly_backup).unwrap().file_path.unwrap();

    let weekly = runner.schedules().get(weekly.id).unwrap();
    assert_eq!(runner.apply_retention(&weekly, created + Duration::days(8)), 1);

    assert!(f.service.get_backup(weekly_backup).is_err());
    assert!(!Path::new(&weekly_path).exists());
    assert!(f.service.get_backup(monthly_backup).is_ok());
    assert!(f.service.get_backup(manual.id).is_ok());
}
