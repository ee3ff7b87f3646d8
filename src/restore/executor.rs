//! Applying a validated archive to the live database
//!
//! Every check that can reject a restore runs before the first write:
//! scope containment, the safety-backup requirement, decoding every
//! table file and the cancellation check. Only then does the executor
//! enter the destructive phase, after which cancellation is refused and
//! the first failing table stops the run.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{RestoreError, RestoreProgress, RestoreResult};
use super::validator::ValidatedArchive;
use crate::backup::TableEntry;
use crate::database::{decode_row, Row, RowSink};
use crate::fs_util::copy_atomic;
use crate::lock::RunControl;
use crate::observability::{log_event, Event};
use crate::scope::{BackupScope, ScopeResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStrategy {
    /// Empty the target tables, then insert the archived rows
    Replace,
    /// Upsert archived rows by primary key, leaving other rows alone
    Merge,
}

impl RestoreStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStrategy::Replace => "replace",
            RestoreStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for RestoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RestoreStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(RestoreStrategy::Replace),
            "merge" => Ok(RestoreStrategy::Merge),
            other => Err(format!(
                "Invalid restore strategy '{}'. Must be one of: replace, merge",
                other
            )),
        }
    }
}

/// Restore lifecycle
///
/// ```text
/// validating -> warned_pending_ack -> applying -> completed
///      |                |                 |
///      +----------------+-----------------+-> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    Validating,
    WarnedPendingAck,
    Applying,
    Completed,
    Failed,
}

impl RestoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::Validating => "validating",
            RestoreStatus::WarnedPendingAck => "warned_pending_ack",
            RestoreStatus::Applying => "applying",
            RestoreStatus::Completed => "completed",
            RestoreStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: RestoreStatus) -> bool {
        use RestoreStatus::*;
        matches!(
            (self, next),
            (Validating, WarnedPendingAck)
                | (Validating, Applying)
                | (Validating, Failed)
                | (WarnedPendingAck, Applying)
                | (WarnedPendingAck, Failed)
                | (Applying, Completed)
                | (Applying, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RestoreStatus::Completed | RestoreStatus::Failed)
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Deleting,
    Inserting,
    Upserting,
    CopyingFiles,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreProgressEvent {
    pub phase: RestorePhase,
    /// Table name, or the relative file path while copying files
    pub item: String,
    pub completed: usize,
    pub total: usize,
}

pub type ProgressCallback = Arc<dyn Fn(&RestoreProgressEvent) + Send + Sync>;

/// What to apply and under which guarantees
#[derive(Debug)]
pub struct RestorePlan<'a> {
    pub archive: &'a ValidatedArchive,
    pub target: BackupScope,
    pub strategy: RestoreStrategy,
    pub force_without_safety_backup: bool,
    /// Set once a safety backup has been taken and verified complete
    pub safety_backup_verified: bool,
    pub uploads_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableResult {
    pub table: String,
    pub rows_deleted: u64,
    pub rows_applied: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub strategy: RestoreStrategy,
    pub target_scope: BackupScope,
    pub tables_applied: u64,
    pub rows_applied: u64,
    pub files_restored: u64,
    pub table_results: Vec<TableResult>,
}

struct DecodedTable<'a> {
    entry: &'a TableEntry,
    rows: Vec<Row>,
}

pub struct RestoreExecutor<'a> {
    sink: &'a dyn RowSink,
}

impl<'a> RestoreExecutor<'a> {
    pub fn new(sink: &'a dyn RowSink) -> Self {
        Self { sink }
    }

    pub fn execute(
        &self,
        plan: &RestorePlan<'_>,
        control: &RunControl,
        progress: Option<&ProgressCallback>,
    ) -> RestoreResult<RestoreSummary> {
        let manifest = &plan.archive.manifest;

        if !manifest.scope.includes(plan.target) {
            return Err(RestoreError::scope_not_in_archive(
                plan.target.as_str(),
                manifest.scope.as_str(),
            ));
        }
        if plan.strategy == RestoreStrategy::Replace
            && !plan.force_without_safety_backup
            && !plan.safety_backup_verified
        {
            return Err(RestoreError::safety_backup_required());
        }

        let tables = self.decode_tables(plan)?;
        let files = if plan.target.includes_uploads() && manifest.uploads.included {
            manifest
                .uploads
                .files
                .iter()
                .map(|f| f.path.clone())
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        if !control.begin_destructive() {
            return Err(RestoreError::cancelled());
        }

        let mut progress_state = RestoreProgress::default();
        let mut results: Vec<TableResult> = tables
            .iter()
            .map(|t| TableResult {
                table: t.entry.name().to_string(),
                rows_deleted: 0,
                rows_applied: 0,
            })
            .collect();
        let total = tables.len();
        let notify = |phase: RestorePhase, item: &str, completed: usize, total: usize| {
            if let Some(cb) = progress {
                cb(&RestoreProgressEvent {
                    phase,
                    item: item.to_string(),
                    completed,
                    total,
                });
            }
        };

        if plan.strategy == RestoreStrategy::Replace {
            // Children first so no parent row is deleted while referenced
            for (done, (table, result)) in tables.iter().zip(results.iter_mut()).rev().enumerate() {
                let name = table.entry.name();
                notify(RestorePhase::Deleting, name, done, total);
                result.rows_deleted = self
                    .sink
                    .delete_all(name)
                    .map_err(|e| apply_error(name, e, &progress_state))?;
            }
        }

        let phase = match plan.strategy {
            RestoreStrategy::Replace => RestorePhase::Inserting,
            RestoreStrategy::Merge => RestorePhase::Upserting,
        };
        for (done, (table, result)) in tables.into_iter().zip(results.iter_mut()).enumerate() {
            let DecodedTable { entry, rows } = table;
            let name = entry.name();
            notify(phase, name, done, total);
            let applied = match plan.strategy {
                RestoreStrategy::Replace => self.sink.insert_rows(name, rows),
                RestoreStrategy::Merge => self.sink.upsert_rows(name, rows),
            }
            .map_err(|e| apply_error(name, e, &progress_state))?;

            result.rows_applied = applied;
            progress_state.tables_applied += 1;
            progress_state.rows_applied += applied;
            log_event(
                Event::RestoreTableApplied,
                &[
                    ("table", name),
                    ("strategy", plan.strategy.as_str()),
                    ("rows", &applied.to_string()),
                ],
            );
        }

        for (done, relative) in files.iter().enumerate() {
            notify(RestorePhase::CopyingFiles, relative, done, files.len());
            let src = plan
                .archive
                .extracted
                .path_of(&format!("{}{}", crate::backup::UPLOADS_PREFIX, relative));
            let dst = plan.uploads_dir.join(relative);
            copy_atomic(&src, &dst).map_err(|e| {
                RestoreError::io_error_at_path(&dst, e).with_progress(progress_state.clone())
            })?;
            progress_state.files_restored += 1;
        }
        if !files.is_empty() {
            log_event(
                Event::RestoreFilesCopied,
                &[
                    ("files", &progress_state.files_restored.to_string()),
                    ("uploads_dir", &plan.uploads_dir.display().to_string()),
                ],
            );
        }

        Ok(RestoreSummary {
            strategy: plan.strategy,
            target_scope: plan.target,
            tables_applied: progress_state.tables_applied,
            rows_applied: progress_state.rows_applied,
            files_restored: progress_state.files_restored,
            table_results: results,
        })
    }

    /// Read every target table before anything is written, so a bad
    /// file rejects the restore while the database is untouched
    fn decode_tables<'m>(&self, plan: &'m RestorePlan<'_>) -> RestoreResult<Vec<DecodedTable<'m>>> {
        let manifest = &plan.archive.manifest;
        let entries: Vec<&TableEntry> = manifest
            .tables
            .iter()
            .filter(|t| plan.target.covers(t.group))
            .collect();

        let names: Vec<String> = entries.iter().map(|t| t.name().to_string()).collect();
        let schemas: Vec<_> = entries.iter().map(|t| t.schema.clone()).collect();
        let order = ScopeResolver::order_by_dependencies(&names, &schemas)
            .map_err(|e| RestoreError::invalid_archive(e.message().to_string()))?;

        let mut decoded = Vec::with_capacity(order.len());
        for name in &order {
            let Some(entry) = entries.iter().find(|t| t.name() == name) else {
                continue;
            };
            let rows = read_table_file(&plan.archive.extracted.path_of(&entry.entry_name()), entry)?;
            decoded.push(DecodedTable { entry, rows });
        }
        Ok(decoded)
    }
}

fn read_table_file(path: &Path, entry: &TableEntry) -> RestoreResult<Vec<Row>> {
    let name = entry.name();
    let body = fs::read_to_string(path).map_err(|e| RestoreError::io_error_at_path(path, e))?;
    let objects: Vec<Map<String, Value>> =
        serde_json::from_str(&body).map_err(|e| RestoreError::table_decode(name, e.to_string()))?;

    if objects.len() as u64 != entry.row_count {
        return Err(RestoreError::table_decode(
            name,
            format!(
                "manifest lists {} row(s) but the file holds {}",
                entry.row_count,
                objects.len()
            ),
        ));
    }

    objects
        .into_iter()
        .map(|object| {
            decode_row(&entry.schema, object).map_err(|e| RestoreError::table_decode(name, e.to_string()))
        })
        .collect()
}

fn apply_error(
    table: &str,
    err: crate::database::DatabaseError,
    progress: &RestoreProgress,
) -> RestoreError {
    let err = if err.is_foreign_key_violation() {
        RestoreError::foreign_key_violation(table, err)
    } else {
        RestoreError::table_failed(table, err)
    };
    err.with_progress(progress.clone())
}
