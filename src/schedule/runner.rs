//! Runs due schedules and enforces retention

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{BackupSchedule, ScheduleManager, ScheduleResult};
use crate::backup::scheduled_backup_name;
use crate::lock::RunControl;
use crate::observability::{log_event, Event};
use crate::records::{BackupStatus, BackupType, RecordFilter};
use crate::service::{BackupService, CreateBackupRequest};

pub const TICK_INTERVAL: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleRunResult {
    pub schedule_id: Uuid,
    pub schedule_name: String,
    pub backup_id: Option<Uuid>,
    pub error: Option<String>,
    pub retention_deleted: u64,
}

#[derive(Clone)]
pub struct ScheduleRunner {
    service: BackupService,
    schedules: ScheduleManager,
}

impl ScheduleRunner {
    pub fn new(service: BackupService, schedules: ScheduleManager) -> Self {
        Self { service, schedules }
    }

    pub fn schedules(&self) -> &ScheduleManager {
        &self.schedules
    }

    /// Run every schedule due at `now`, one after another
    pub async fn tick(&self, now: DateTime<Utc>) -> ScheduleResult<Vec<ScheduleRunResult>> {
        let due = self.schedules.due(now)?;
        let mut results = Vec::with_capacity(due.len());
        for schedule in due {
            results.push(self.run_one(&schedule, now).await);
        }
        Ok(results)
    }

    async fn run_one(
        &self,
        schedule: &BackupSchedule,
        now: DateTime<Utc>,
    ) -> ScheduleRunResult {
        let request = CreateBackupRequest {
            scope: schedule.scope,
            backup_type: BackupType::Scheduled,
            name: Some(scheduled_backup_name(&schedule.name, now)),
            description: Some(format!("Scheduled backup: {}", schedule.name)),
            created_by: schedule.created_by.clone(),
            sync_to_cloud: schedule.sync_to_cloud,
            schedule_id: Some(schedule.id),
        };

        let id = schedule.id.to_string();
        match self.service.create_backup(request, RunControl::new()).await {
            Ok(record) => {
                self.note_run(schedule, Some(record.id), true, now);
                log_event(
                    Event::ScheduleRun,
                    &[
                        ("schedule_id", &id),
                        ("schedule", &schedule.name),
                        ("backup_id", &record.id.to_string()),
                    ],
                );
                let retention_deleted = self.apply_retention(schedule, now);
                ScheduleRunResult {
                    schedule_id: schedule.id,
                    schedule_name: schedule.name.clone(),
                    backup_id: Some(record.id),
                    error: None,
                    retention_deleted,
                }
            }
            Err(e) => {
                self.note_run(schedule, None, false, now);
                log_event(
                    Event::ScheduleFailed,
                    &[
                        ("schedule_id", &id),
                        ("schedule", &schedule.name),
                        ("reason", &e.to_string()),
                    ],
                );
                ScheduleRunResult {
                    schedule_id: schedule.id,
                    schedule_name: schedule.name.clone(),
                    backup_id: None,
                    error: Some(e.to_string()),
                    retention_deleted: 0,
                }
            }
        }
    }

    /// The backup already happened; a schedule that cannot be updated
    /// (deleted mid-run, store error) is logged and the tick goes on
    fn note_run(
        &self,
        schedule: &BackupSchedule,
        backup_id: Option<Uuid>,
        succeeded: bool,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self.schedules.record_run(schedule.id, backup_id, succeeded, now) {
            log_event(
                Event::ScheduleFailed,
                &[
                    ("schedule_id", &schedule.id.to_string()),
                    ("schedule", &schedule.name),
                    ("reason", &e.to_string()),
                ],
            );
        }
    }

    /// Delete this schedule's backups older than its retention window,
    /// archives included. Other schedules and manual backups are left
    /// alone.
    pub fn apply_retention(&self, schedule: &BackupSchedule, now: DateTime<Utc>) -> u64 {
        let cutoff = now - Duration::days(i64::from(schedule.retention_days));
        let filter = RecordFilter {
            backup_type: Some(BackupType::Scheduled),
            schedule_id: Some(schedule.id),
            ..RecordFilter::default()
        };
        let records = match self.service.list_backups(&filter) {
            Ok(records) => records,
            Err(e) => {
                log_event(
                    Event::ScheduleFailed,
                    &[("schedule_id", &schedule.id.to_string()), ("reason", &e.to_string())],
                );
                return 0;
            }
        };

        let mut deleted = 0;
        for record in records
            .iter()
            .filter(|r| r.created_at < cutoff && r.status != BackupStatus::InProgress)
        {
            match self.service.delete_backup(record.id, true) {
                Ok(_) => {
                    deleted += 1;
                    log_event(
                        Event::RetentionDeleted,
                        &[
                            ("schedule_id", &schedule.id.to_string()),
                            ("backup_id", &record.id.to_string()),
                            ("name", &record.name),
                        ],
                    );
                }
                Err(e) => log_event(
                    Event::ScheduleFailed,
                    &[("backup_id", &record.id.to_string()), ("reason", &e.to_string())],
                ),
            }
        }
        deleted
    }

    /// Tick every minute until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        log_event(Event::ScheduleFailed, &[("reason", &e.to_string())]);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, ScopeConfig};
    use crate::database::{row, ColumnKind, MemoryDatabase, SqlValue, TableSchema};
    use crate::records::{BackupRecord, NewBackup};
    use crate::schedule::NewSchedule;
    use crate::scope::BackupScope;
    use crate::store::{MemoryStore, Store, StoreError, StoreResult};
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn runner(temp: &TempDir) -> ScheduleRunner {
        runner_with(temp, Arc::new(MemoryStore::<BackupSchedule>::new()))
    }

    fn runner_with(temp: &TempDir, schedule_store: Arc<dyn Store<BackupSchedule>>) -> ScheduleRunner {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table(
            TableSchema::new("email_template", "id", ColumnKind::Integer)
                .column("subject", ColumnKind::Text),
        )
        .unwrap();
        db.insert(
            "email_template",
            row([("id", SqlValue::from(1)), ("subject", "Hi".into())]),
        )
        .unwrap();

        let mut config = BackupConfig::with_dirs(
            temp.path().join("backups"),
            temp.path().join("uploads"),
            temp.path().join("data"),
        );
        config.scopes = ScopeConfig::new(&["email_template"], &[]);
        let service =
            BackupService::new(config, db, Arc::new(MemoryStore::<BackupRecord>::new())).unwrap();
        ScheduleRunner::new(service, ScheduleManager::new(schedule_store))
    }

    /// Schedule store whose updates fail for one id
    struct StuckStore {
        inner: MemoryStore<BackupSchedule>,
        stuck: std::sync::Mutex<Option<Uuid>>,
    }

    impl Store<BackupSchedule> for StuckStore {
        fn list(&self) -> StoreResult<Vec<BackupSchedule>> {
            self.inner.list()
        }

        fn get(&self, id: Uuid) -> StoreResult<Option<BackupSchedule>> {
            self.inner.get(id)
        }

        fn put(&self, item: BackupSchedule) -> StoreResult<()> {
            self.inner.put(item)
        }

        fn remove(&self, id: Uuid) -> StoreResult<bool> {
            self.inner.remove(id)
        }

        fn update(
            &self,
            id: Uuid,
            apply: &mut dyn FnMut(&mut BackupSchedule) -> bool,
        ) -> StoreResult<Option<BackupSchedule>> {
            if *self.stuck.lock().unwrap() == Some(id) {
                return Err(StoreError::Poisoned);
            }
            self.inner.update(id, apply)
        }
    }

    fn at(day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_tick_runs_due_schedule() {
        let temp = TempDir::new().unwrap();
        let runner = runner(&temp);
        let schedule = runner
            .schedules()
            .create(NewSchedule::new("Nightly Settings", "0 2 * * *", BackupScope::Settings), at(1, 0))
            .unwrap();

        assert!(runner.tick(at(1, 1)).await.unwrap().is_empty());

        let results = runner.tick(at(1, 2)).await.unwrap();
        assert_eq!(results.len(), 1);
        let backup_id = results[0].backup_id.unwrap();

        let record = runner.service.get_backup(backup_id).unwrap();
        assert_eq!(record.backup_type, BackupType::Scheduled);
        assert_eq!(record.schedule_id, Some(schedule.id));
        assert!(record.name.starts_with("scheduled-nightly-settings-"));

        let schedule = runner.schedules().get(schedule.id).unwrap();
        assert_eq!(schedule.success_count, 1);
        assert_eq!(schedule.last_backup_id, Some(backup_id));
    }

    #[tokio::test]
    async fn test_retention_only_touches_expired_backups_of_same_schedule() {
        let temp = TempDir::new().unwrap();
        let runner = runner(&temp);
        let mut new = NewSchedule::new("nightly", "0 2 * * *", BackupScope::Settings);
        new.retention_days = 7;
        let schedule = runner.schedules().create(new, at(1, 0)).unwrap();
        let other = runner
            .schedules()
            .create(NewSchedule::new("other", "0 3 * * *", BackupScope::Settings), at(1, 0))
            .unwrap();

        let own = runner
            .service
            .create_backup(
                CreateBackupRequest {
                    backup_type: BackupType::Scheduled,
                    schedule_id: Some(schedule.id),
                    name: Some("own".into()),
                    ..CreateBackupRequest::new(BackupScope::Settings)
                },
                RunControl::new(),
            )
            .await
            .unwrap();
        let mut foreign = NewBackup::new(BackupType::Scheduled, BackupScope::Settings, "foreign");
        foreign.schedule_id = Some(other.id);
        let foreign = runner.service.records().begin(foreign).unwrap();
        let manual = runner
            .service
            .records()
            .begin(NewBackup::new(BackupType::Manual, BackupScope::Settings, "manual"))
            .unwrap();

        // Inside the window nothing goes
        assert_eq!(runner.apply_retention(&schedule, Utc::now()), 0);

        let later = Utc::now() + Duration::days(8);
        assert_eq!(runner.apply_retention(&schedule, later), 1);
        assert!(runner.service.get_backup(own.id).is_err());
        assert!(!Path::new(own.file_path.as_deref().unwrap()).exists());
        assert!(runner.service.get_backup(foreign.id).is_ok());
        assert!(runner.service.get_backup(manual.id).is_ok());
    }

    #[tokio::test]
    async fn test_tick_survives_schedule_bookkeeping_failure() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(StuckStore {
            inner: MemoryStore::new(),
            stuck: std::sync::Mutex::new(None),
        });
        let runner = runner_with(&temp, store.clone());
        let broken = runner
            .schedules()
            .create(NewSchedule::new("broken", "0 2 * * *", BackupScope::Settings), at(1, 0))
            .unwrap();
        let healthy = runner
            .schedules()
            .create(NewSchedule::new("healthy", "0 2 * * *", BackupScope::Settings), at(1, 0))
            .unwrap();
        *store.stuck.lock().unwrap() = Some(broken.id);

        let results = runner.tick(at(1, 2)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.backup_id.is_some() && r.error.is_none()));

        assert_eq!(runner.schedules().get(healthy.id).unwrap().success_count, 1);
        assert_eq!(runner.schedules().get(broken.id).unwrap().success_count, 0);
    }

    #[tokio::test]
    async fn test_tick_continues_when_schedule_deleted_before_bookkeeping() {
        let temp = TempDir::new().unwrap();
        let runner = runner(&temp);
        let schedule = runner
            .schedules()
            .create(NewSchedule::new("gone", "0 2 * * *", BackupScope::Settings), at(1, 0))
            .unwrap();
        let snapshot = runner.schedules().get(schedule.id).unwrap();
        runner.schedules().delete(schedule.id).unwrap();

        let result = runner.run_one(&snapshot, at(1, 2)).await;
        assert!(result.backup_id.is_some());
        assert!(runner.schedules().list().unwrap().is_empty());
    }
}
