//! Backup pipeline
//!
//! A backup produces one self-describing, compressed archive for a scope.
//!
//! # Archive Format
//!
//! ```text
//! <name>.tar.gz
//! ├── <table>.json          one per table, parent tables first
//! ├── uploads/...           mirrored uploads tree (full scope only)
//! └── backup_manifest.json
//! <name>.tar.gz.sha256      checksum of the compressed bytes
//! ```
//!
//! # Algorithm
//!
//! 1. Resolve the scope into tables, ordered parent-before-child
//! 2. Dump each table into a private staging directory
//! 3. Enumerate uploaded files (full scope)
//! 4. Package staging + uploads + manifest into `<name>.tar.gz.partial`
//! 5. fsync, checksum, rename into place, write the sidecar
//! 6. Remove the staging directory
//!
//! Cancellation is honored between tables and before packaging. Any
//! failure removes the partial archive.
//!
//! The pipeline is synchronous; `BackupService` runs it on the blocking
//! pool while holding the operation lock.

mod archive;
pub mod checksum;
mod dumper;
mod errors;
mod manifest;

pub use archive::{
    cleanup_partial_archive, collect_upload_files, partial_path, ArchiveOutput, ArchiveWriter,
    UploadFile,
};
pub use dumper::{TableDump, TableDumper};
pub use errors::{BackupError, BackupErrorCode, BackupResult};
pub use manifest::{
    table_entry_name, BackupManifest, TableEntry, UploadEntry, UploadsSummary, FORMAT_VERSION,
    UPLOADS_PREFIX,
};

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BackupConfig;
use crate::database::RowSource;
use crate::lock::RunControl;
use crate::observability::{log_event, Event};
use crate::scope::{BackupScope, ScopeResolver, TableGroup};

/// Name prefix for operator-requested backups
pub const MANUAL_BACKUP_PREFIX: &str = "gk-nexus-backup-";

/// Name prefix for backups taken right before a restore
pub const SAFETY_BACKUP_PREFIX: &str = "pre-restore-safety-";

pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Prefix of the per-backup staging directory in the backup directory
pub const STAGING_PREFIX: &str = ".staging-";

const RESTORE_WORK_PREFIX: &str = ".restore-";
const PARTIAL_SUFFIX: &str = ".partial";

/// Everything a run needs, decided before any I/O
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    pub backup_id: Uuid,
    pub name: String,
    pub scope: BackupScope,
    /// Parent tables before child tables
    pub tables: Vec<String>,
    pub include_uploads: bool,
    pub output_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// What a completed run stores on its record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub file_path: String,
    pub file_size: u64,
    pub checksum: String,
    pub table_count: u64,
    pub record_count: u64,
    pub uploaded_files_count: u64,
    pub uploaded_files_size: u64,
    pub app_version: String,
    pub schema_version: String,
}

pub struct BackupPipeline<'a> {
    config: &'a BackupConfig,
    source: &'a dyn RowSource,
    resolver: &'a ScopeResolver,
}

impl<'a> BackupPipeline<'a> {
    pub fn new(
        config: &'a BackupConfig,
        source: &'a dyn RowSource,
        resolver: &'a ScopeResolver,
    ) -> Self {
        Self {
            config,
            source,
            resolver,
        }
    }

    /// Resolve `scope` against the live schemas and pick the output path.
    ///
    /// Nothing is written.
    pub fn plan(
        &self,
        backup_id: Uuid,
        name: &str,
        scope: BackupScope,
        created_at: DateTime<Utc>,
    ) -> BackupResult<BackupPlan> {
        let resolved = self.resolver.resolve(scope);
        let schemas = resolved
            .tables
            .iter()
            .map(|t| {
                self.source
                    .table_schema(t)
                    .map_err(|e| BackupError::table_dump(t, e))
            })
            .collect::<BackupResult<Vec<_>>>()?;
        let tables = ScopeResolver::order_by_dependencies(&resolved.tables, &schemas)?;

        Ok(BackupPlan {
            backup_id,
            name: name.to_string(),
            scope,
            tables,
            include_uploads: resolved.include_uploads,
            output_path: unique_archive_path(&self.config.backup_dir, name),
            created_at,
        })
    }

    /// Execute `plan`. The staging directory is always removed; on
    /// failure no archive, partial file or sidecar remains.
    pub fn run(&self, plan: &BackupPlan, control: &RunControl) -> BackupResult<ArchiveMetadata> {
        let staging = staging_dir(&self.config.backup_dir, plan.backup_id);
        fs::create_dir_all(&staging).map_err(|e| {
            BackupError::io_error(
                format!("Failed to create staging directory: {}", staging.display()),
                e,
            )
        })?;

        let result = self.run_staged(plan, control, &staging);

        let _ = fs::remove_dir_all(&staging);
        if result.is_err() {
            cleanup_partial_archive(&partial_path(&plan.output_path));
        }
        result
    }

    fn run_staged(
        &self,
        plan: &BackupPlan,
        control: &RunControl,
        staging: &Path,
    ) -> BackupResult<ArchiveMetadata> {
        let dumper = TableDumper::new(self.source);
        let mut manifest = BackupManifest::new(
            &plan.backup_id.to_string(),
            &plan.name,
            plan.scope,
            plan.created_at,
            &self.config.app_version,
            &self.config.schema_version,
        );

        let mut dumps = Vec::with_capacity(plan.tables.len());
        for table in &plan.tables {
            if control.is_cancelled() {
                log_event(
                    Event::BackupCancelled,
                    &[("backup_id", &plan.backup_id.to_string()), ("before_table", table)],
                );
                return Err(BackupError::cancelled(Some(table)));
            }

            let dump = dumper.dump(table, staging)?;
            log_event(
                Event::TableDumped,
                &[
                    ("table", dump.table()),
                    ("rows", &dump.row_count.to_string()),
                    ("bytes", &dump.bytes.to_string()),
                ],
            );
            manifest.tables.push(TableEntry {
                schema: dump.schema.clone(),
                group: self.resolver.group_of(table).unwrap_or(TableGroup::Data),
                row_count: dump.row_count,
                sha256: dump.sha256.clone(),
            });
            dumps.push(dump);
        }

        let uploads = if plan.include_uploads {
            collect_upload_files(&self.config.uploads_dir)?
        } else {
            Vec::new()
        };

        if control.is_cancelled() {
            log_event(
                Event::BackupCancelled,
                &[("backup_id", &plan.backup_id.to_string()), ("before_table", "-")],
            );
            return Err(BackupError::cancelled(None));
        }

        let output = ArchiveWriter::write(&mut manifest, &dumps, &uploads, &plan.output_path)?;
        log_event(
            Event::ArchiveWritten,
            &[
                ("path", &output.path.display().to_string()),
                ("bytes", &output.size.to_string()),
                ("checksum", &output.checksum),
            ],
        );

        Ok(ArchiveMetadata {
            file_path: output.path.display().to_string(),
            file_size: output.size,
            checksum: output.checksum,
            table_count: manifest.tables.len() as u64,
            record_count: manifest.total_rows(),
            uploaded_files_count: output.uploaded_files_count,
            uploaded_files_size: output.uploaded_files_size,
            app_version: manifest.app_version,
            schema_version: manifest.schema_version,
        })
    }
}

/// `<prefix><YYYY-MM-DDTHH-MM-SS>`
pub fn backup_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}{}", prefix, at.format("%Y-%m-%dT%H-%M-%S"))
}

/// `scheduled-<slug>-<YYYY-MM-DDTHH-MM-SS>`
pub fn scheduled_backup_name(schedule_name: &str, at: DateTime<Utc>) -> String {
    backup_name(&format!("scheduled-{}-", slugify(schedule_name)), at)
}

/// Lowercase, alphanumerics kept, every other run of characters becomes `-`
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "schedule".to_string()
    } else {
        slug
    }
}

/// File stem safe for any filesystem: letters, digits, `.`, `_`, `-`
pub fn archive_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let stem = stem.trim_matches('.').to_string();
    if stem.is_empty() {
        "backup".to_string()
    } else {
        stem
    }
}

/// `<dir>/<stem>.tar.gz`, suffixed `-1`, `-2`, ... if taken
pub fn unique_archive_path(dir: &Path, name: &str) -> PathBuf {
    let stem = archive_file_stem(name);
    let first = dir.join(format!("{}{}", stem, ARCHIVE_EXTENSION));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{}-{}{}", stem, n, ARCHIVE_EXTENSION)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

pub fn staging_dir(backup_dir: &Path, backup_id: Uuid) -> PathBuf {
    backup_dir.join(format!("{}{}", STAGING_PREFIX, backup_id))
}

/// Remove what an interrupted process left in `dir`: staging and restore
/// work directories and `.partial` archives. Returns the removed paths.
///
/// Only valid while nothing else is backing up into or restoring from
/// `dir`.
pub fn remove_leftovers(dir: &Path) -> BackupResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| BackupError::io_error_at_path(dir, e))? {
        let entry = entry.map_err(|e| BackupError::io_error_at_path(dir, e))?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };

        let result = if path.is_dir()
            && (name.starts_with(STAGING_PREFIX) || name.starts_with(RESTORE_WORK_PREFIX))
        {
            fs::remove_dir_all(&path)
        } else if path.is_file() && name.ends_with(PARTIAL_SUFFIX) {
            fs::remove_file(&path)
        } else {
            continue;
        };
        result.map_err(|e| BackupError::io_error_at_path(&path, e))?;
        removed.push(path);
    }
    removed.sort();
    Ok(removed)
}

pub fn is_archive_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(ARCHIVE_EXTENSION) && !n.starts_with('.'))
        .unwrap_or(false)
}
