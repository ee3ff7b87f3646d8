//! Schedule CRUD and due-time bookkeeping

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use uuid::Uuid;

use super::{
    BackupSchedule, NewSchedule, ScheduleError, ScheduleResult, ScheduleUpdate, MAX_RETENTION_DAYS,
};
use crate::store::Store;

/// Minimum spacing between two runs of one schedule
const MIN_RUN_SPACING_SECS: i64 = 60;

/// First occurrence of `expression` strictly after `after`
pub fn next_run_after(expression: &str, after: DateTime<Utc>) -> ScheduleResult<DateTime<Utc>> {
    let cron = parse_cron(expression)?;
    cron.find_next_occurrence(&after, false)
        .map_err(|e| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

fn parse_cron(expression: &str) -> ScheduleResult<Cron> {
    Cron::new(expression.trim())
        .parse()
        .map_err(|e| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

fn validate_name(name: &str) -> ScheduleResult<()> {
    if name.trim().is_empty() {
        return Err(ScheduleError::Invalid("name is required".to_string()));
    }
    Ok(())
}

fn validate_retention(days: u32) -> ScheduleResult<()> {
    if days == 0 || days > MAX_RETENTION_DAYS {
        return Err(ScheduleError::Invalid(format!(
            "retention_days must be between 1 and {}",
            MAX_RETENTION_DAYS
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ScheduleManager {
    store: Arc<dyn Store<BackupSchedule>>,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn Store<BackupSchedule>>) -> Self {
        Self { store }
    }

    pub fn create(&self, new: NewSchedule, now: DateTime<Utc>) -> ScheduleResult<BackupSchedule> {
        validate_name(&new.name)?;
        validate_retention(new.retention_days)?;
        let next_run_at = if new.is_enabled {
            Some(next_run_after(&new.cron_expression, now)?)
        } else {
            parse_cron(&new.cron_expression)?;
            None
        };

        let schedule = BackupSchedule {
            id: Uuid::new_v4(),
            name: new.name.trim().to_string(),
            description: new.description,
            cron_expression: new.cron_expression.trim().to_string(),
            scope: new.scope,
            is_enabled: new.is_enabled,
            retention_days: new.retention_days,
            sync_to_cloud: new.sync_to_cloud,
            last_run_at: None,
            next_run_at,
            last_backup_id: None,
            success_count: 0,
            failure_count: 0,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        self.store.put(schedule.clone())?;
        Ok(schedule)
    }

    pub fn update(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> ScheduleResult<BackupSchedule> {
        let mut schedule = self.get(id)?;

        if let Some(name) = update.name {
            validate_name(&name)?;
            schedule.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            schedule.description = Some(description);
        }
        if let Some(expression) = update.cron_expression {
            parse_cron(&expression)?;
            schedule.cron_expression = expression.trim().to_string();
        }
        if let Some(scope) = update.scope {
            schedule.scope = scope;
        }
        if let Some(days) = update.retention_days {
            validate_retention(days)?;
            schedule.retention_days = days;
        }
        if let Some(sync) = update.sync_to_cloud {
            schedule.sync_to_cloud = sync;
        }
        if let Some(enabled) = update.is_enabled {
            schedule.is_enabled = enabled;
        }

        schedule.next_run_at = if schedule.is_enabled {
            Some(next_run_after(&schedule.cron_expression, now)?)
        } else {
            None
        };
        schedule.updated_at = now;
        self.store.put(schedule.clone())?;
        Ok(schedule)
    }

    pub fn set_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> ScheduleResult<BackupSchedule> {
        self.update(
            id,
            ScheduleUpdate {
                is_enabled: Some(enabled),
                ..ScheduleUpdate::default()
            },
            now,
        )
    }

    pub fn delete(&self, id: Uuid) -> ScheduleResult<BackupSchedule> {
        let schedule = self.get(id)?;
        self.store.remove(id)?;
        Ok(schedule)
    }

    pub fn get(&self, id: Uuid) -> ScheduleResult<BackupSchedule> {
        self.store.get(id)?.ok_or(ScheduleError::NotFound(id))
    }

    /// Newest first
    pub fn list(&self) -> ScheduleResult<Vec<BackupSchedule>> {
        let mut schedules = self.store.list()?;
        schedules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(schedules)
    }

    /// Enabled schedules whose next run has passed and that have not run
    /// within the last minute
    pub fn due(&self, now: DateTime<Utc>) -> ScheduleResult<Vec<BackupSchedule>> {
        let spacing = Duration::seconds(MIN_RUN_SPACING_SECS);
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|s| s.is_enabled)
            .filter(|s| s.next_run_at.map_or(false, |next| next <= now))
            .filter(|s| s.last_run_at.map_or(true, |last| now - last >= spacing))
            .collect())
    }

    /// Store the outcome of a run and advance `next_run_at`
    pub fn record_run(
        &self,
        id: Uuid,
        backup_id: Option<Uuid>,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> ScheduleResult<BackupSchedule> {
        let mut next_error = None;
        let updated = self.store.update(id, &mut |schedule| {
            let next_run_at = if schedule.is_enabled {
                match next_run_after(&schedule.cron_expression, at) {
                    Ok(next) => Some(next),
                    Err(e) => {
                        next_error = Some(e);
                        return false;
                    }
                }
            } else {
                None
            };
            schedule.last_run_at = Some(at);
            if backup_id.is_some() {
                schedule.last_backup_id = backup_id;
            }
            if succeeded {
                schedule.success_count += 1;
            } else {
                schedule.failure_count += 1;
            }
            schedule.next_run_at = next_run_at;
            schedule.updated_at = at;
            true
        })?;
        if let Some(e) = next_error {
            return Err(e);
        }
        updated.ok_or(ScheduleError::NotFound(id))
    }
}
