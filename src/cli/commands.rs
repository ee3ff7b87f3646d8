//! CLI command implementations
//!
//! Every command loads the configuration once, opens the JSON database
//! file and the record store, runs a single operation and prints one JSON
//! response. `serve` keeps the HTTP API and the schedule runner alive
//! until Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{BackupConfig, Environment};
use crate::database::MemoryDatabase;
use crate::http_server::{BackupState, HttpServer, RestoreHook};
use crate::lock::RunControl;
use crate::observability::{log_event, Event, Logger};
use crate::records::{BackupStatus, BackupType, RecordFilter};
use crate::restore::RestoreStrategy;
use crate::schedule::{BackupSchedule, ScheduleError, ScheduleManager, ScheduleRunner};
use crate::scope::BackupScope;
use crate::service::{BackupService, CreateBackupRequest, RestoreOptions, RestoreOutcome};
use crate::store::JsonFileStore;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Main CLI entry point
///
/// Failures are printed as a JSON error response and also returned so the
/// process exits non-zero.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    match run_command(cli.command) {
        Ok(()) => Ok(()),
        Err(e) => {
            write_error(e.code_str(), e.message())?;
            Err(e)
        }
    }
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Backup {
            config,
            scope,
            name,
            description,
            created_by,
            sync,
        } => {
            let mut request = CreateBackupRequest::new(parse_scope(&scope)?);
            request.name = name;
            request.description = description;
            request.created_by = created_by;
            request.sync_to_cloud = sync;
            backup(&config, request)
        }
        Command::Validate {
            config,
            archive,
            id,
            checksum,
        } => validate(&config, &ArchiveArg::from_args(archive, id)?, checksum),
        Command::Restore {
            config,
            archive,
            id,
            scope,
            strategy,
            safety_backup,
            safety_backup_id,
            force,
            acknowledge_warnings,
            checksum,
            created_by,
        } => {
            let strategy: RestoreStrategy =
                strategy.parse().map_err(CliError::invalid_argument)?;
            let mut options = RestoreOptions::new(strategy);
            options.create_safety_backup = safety_backup;
            options.safety_backup_id = safety_backup_id;
            options.force_without_safety_backup = force;
            options.acknowledge_warnings = acknowledge_warnings;
            options.expected_checksum = checksum;
            options.created_by = created_by;
            let archive = ArchiveArg::from_args(archive, id)?;
            restore(&config, &archive, parse_scope(&scope)?, options)
        }
        Command::Preview {
            config,
            archive,
            id,
            scope,
            checksum,
        } => preview(
            &config,
            &ArchiveArg::from_args(archive, id)?,
            parse_scope(&scope)?,
            checksum,
        ),
        Command::List {
            config,
            status,
            backup_type,
            scope,
            start_date,
            end_date,
            page,
            limit,
        } => {
            let filter = RecordFilter {
                status: status
                    .as_deref()
                    .map(str::parse::<BackupStatus>)
                    .transpose()
                    .map_err(CliError::invalid_argument)?,
                backup_type: backup_type
                    .as_deref()
                    .map(str::parse::<BackupType>)
                    .transpose()
                    .map_err(CliError::invalid_argument)?,
                scope: scope.as_deref().map(parse_scope).transpose()?,
                schedule_id: None,
                created_after: start_date,
                created_before: end_date,
                page,
                limit,
            };
            list(&config, &filter)
        }
        Command::Stats { config, scope } => {
            let scope = scope.as_deref().map(parse_scope).transpose()?;
            stats(&config, scope)
        }
        Command::Delete {
            config,
            id,
            delete_file,
        } => delete(&config, id, delete_file),
        Command::CleanupFailed { config } => cleanup_failed(&config),
        Command::DiskFiles { config } => disk_files(&config),
        Command::CloudList { config } => cloud_list(&config),
        Command::CloudTest { config } => cloud_test(&config),
        Command::CloudDownload { config, remote_id } => cloud_download(&config, &remote_id),
        Command::CloudDelete { config, remote_id } => cloud_delete(&config, &remote_id),
        Command::CloudRestore {
            config,
            remote_id,
            scope,
            strategy,
            safety_backup,
            force,
            acknowledge_warnings,
            created_by,
        } => {
            let strategy: RestoreStrategy =
                strategy.parse().map_err(CliError::invalid_argument)?;
            let mut options = RestoreOptions::new(strategy);
            options.create_safety_backup = safety_backup;
            options.force_without_safety_backup = force;
            options.acknowledge_warnings = acknowledge_warnings;
            options.created_by = created_by;
            cloud_restore(&config, &remote_id, parse_scope(&scope)?, options)
        }
        Command::DriveStatus { config } => drive_status(&config),
        Command::DriveAuthUrl { config, state } => drive_auth_url(&config, state.as_deref()),
        Command::DriveConnect { config, code } => drive_connect(&config, &code),
        Command::DriveDisconnect { config } => drive_disconnect(&config),
        Command::ScheduleRun { config } => schedule_run(&config),
        Command::Serve { config, port } => serve(&config, port),
    }
}

fn parse_scope(value: &str) -> CliResult<BackupScope> {
    value.parse::<BackupScope>().map_err(CliError::from)
}

/// Archive named on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveArg {
    Path(PathBuf),
    /// Completed backup; its recorded checksum is expected
    Backup(Uuid),
}

impl ArchiveArg {
    pub fn from_args(archive: Option<PathBuf>, id: Option<Uuid>) -> CliResult<Self> {
        match (archive, id) {
            (Some(path), None) => Ok(ArchiveArg::Path(path)),
            (None, Some(id)) => Ok(ArchiveArg::Backup(id)),
            _ => Err(CliError::invalid_argument(
                "give either an archive path or --id, not both",
            )),
        }
    }
}

/// Archive path plus the checksum it must match
#[derive(Debug)]
struct ResolvedArchive {
    path: PathBuf,
    checksum: Option<String>,
    backup_id: Option<Uuid>,
}

/// Loaded configuration plus the handles every command needs
struct Context {
    config: BackupConfig,
    db: Arc<MemoryDatabase>,
    service: BackupService,
}

impl Context {
    fn open(config_path: &Path) -> CliResult<Self> {
        let config = BackupConfig::load(config_path, &Environment::capture())?;
        Logger::set_min_severity(config.log_severity());
        log_event(
            Event::ConfigLoaded,
            &[
                ("config", &config_path.display().to_string()),
                ("backup_dir", &config.backup_dir.display().to_string()),
            ],
        );

        let db_path = config.database_path();
        let db = if db_path.is_file() {
            MemoryDatabase::load_from_file(&db_path)?
        } else {
            MemoryDatabase::new()
        };
        let db = Arc::new(db);
        let service = BackupService::open(config.clone(), db.clone())?;
        Ok(Self {
            config,
            db,
            service,
        })
    }

    /// A checksum given on the command line wins over the recorded one
    fn resolve(&self, archive: &ArchiveArg, checksum: Option<String>) -> CliResult<ResolvedArchive> {
        match archive {
            ArchiveArg::Path(path) => Ok(ResolvedArchive {
                path: path.clone(),
                checksum,
                backup_id: None,
            }),
            ArchiveArg::Backup(id) => {
                let recorded = self.service.backup_archive(*id)?;
                Ok(ResolvedArchive {
                    path: recorded.path,
                    checksum: checksum.or(recorded.checksum),
                    backup_id: Some(recorded.backup_id),
                })
            }
        }
    }

    fn save_database(&self) -> CliResult<()> {
        self.db.save_to_file(&self.config.database_path())?;
        Ok(())
    }

    fn schedule_runner(&self) -> CliResult<ScheduleRunner> {
        let store = JsonFileStore::<BackupSchedule>::open(self.config.schedules_path())
            .map_err(ScheduleError::from)?;
        Ok(ScheduleRunner::new(
            self.service.clone(),
            ScheduleManager::new(Arc::new(store)),
        ))
    }
}

fn runtime() -> CliResult<Runtime> {
    Runtime::new().map_err(|e| CliError::io_error(format!("Failed to create tokio runtime: {}", e)))
}

/// Cancel `control` on Ctrl-C. A restore past its first write refuses.
async fn cancel_on_interrupt(control: RunControl) {
    if tokio::signal::ctrl_c().await.is_ok() && control.cancel().is_err() {
        log_event(Event::RestoreCancelRejected, &[("signal", "ctrl_c")]);
    }
}

pub fn backup(config_path: &Path, request: CreateBackupRequest) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let control = RunControl::new();
    let record = runtime()?.block_on(async {
        let watcher = tokio::spawn(cancel_on_interrupt(control.clone()));
        let result = ctx.service.create_backup(request, control).await;
        watcher.abort();
        result
    })?;
    write_response(&record)
}

pub fn validate(
    config_path: &Path,
    archive: &ArchiveArg,
    checksum: Option<String>,
) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let archive = ctx.resolve(archive, checksum)?;
    let report = runtime()?.block_on(
        ctx.service
            .validate_archive(&archive.path, archive.checksum.as_deref()),
    )?;
    write_response(&report)
}

pub fn preview(
    config_path: &Path,
    archive: &ArchiveArg,
    scope: BackupScope,
    checksum: Option<String>,
) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let archive = ctx.resolve(archive, checksum)?;
    let preview = runtime()?.block_on(ctx.service.preview_restore(
        &archive.path,
        scope,
        archive.checksum.as_deref(),
    ))?;
    write_response(&preview)
}

/// Restore and persist the database file afterwards
pub fn restore(
    config_path: &Path,
    archive: &ArchiveArg,
    scope: BackupScope,
    mut options: RestoreOptions,
) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let archive = ctx.resolve(archive, options.expected_checksum.take())?;
    options.expected_checksum = archive.checksum;
    options.source_backup_id = archive.backup_id;
    let outcome = run_restore(&ctx, &archive.path, scope, options)?;
    ctx.save_database()?;
    write_response(&outcome)
}

fn run_restore(
    ctx: &Context,
    archive: &Path,
    scope: BackupScope,
    options: RestoreOptions,
) -> CliResult<RestoreOutcome> {
    let control = RunControl::new();
    let outcome = runtime()?.block_on(async {
        let watcher = tokio::spawn(cancel_on_interrupt(control.clone()));
        let result = ctx
            .service
            .restore_from_archive(archive, scope, options, control, None)
            .await;
        watcher.abort();
        result
    })?;
    Ok(outcome)
}

/// A page with totals when `--page` is given, otherwise a plain list
pub fn list(config_path: &Path, filter: &RecordFilter) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    if filter.page.is_some() {
        write_response(&ctx.service.list_backup_page(filter)?)
    } else {
        write_response(&ctx.service.list_backups(filter)?)
    }
}

/// Record totals, or what a backup of `scope` would contain
pub fn stats(config_path: &Path, scope: Option<BackupScope>) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    match scope {
        Some(scope) => write_response(&ctx.service.backup_stats(scope)?),
        None => write_response(&ctx.service.record_stats()?),
    }
}

pub fn delete(config_path: &Path, id: Uuid, delete_file: bool) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    write_response(&ctx.service.delete_backup(id, delete_file)?)
}

pub fn cleanup_failed(config_path: &Path) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let deleted = ctx.service.cleanup_failed()?;
    write_response(&json!({ "deleted": deleted }))
}

pub fn disk_files(config_path: &Path) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    write_response(&ctx.service.list_disk_archives()?)
}

pub fn cloud_list(config_path: &Path) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let backups = runtime()?.block_on(ctx.service.list_cloud_backups())?;
    write_response(&json!({
        "provider": ctx.service.cloud_provider_name(),
        "backups": backups,
    }))
}

pub fn cloud_test(config_path: &Path) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    runtime()?.block_on(ctx.service.test_cloud_connection())?;
    write_response(&json!({
        "provider": ctx.service.cloud_provider_name(),
        "connected": true,
    }))
}

pub fn cloud_download(config_path: &Path, remote_id: &str) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    write_response(&runtime()?.block_on(ctx.service.download_cloud_backup(remote_id))?)
}

pub fn cloud_delete(config_path: &Path, remote_id: &str) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    runtime()?.block_on(ctx.service.delete_cloud_backup(remote_id))?;
    write_response(&json!({ "deleted": true }))
}

/// Download a remote archive, then restore it like a backup by id
pub fn cloud_restore(
    config_path: &Path,
    remote_id: &str,
    scope: BackupScope,
    mut options: RestoreOptions,
) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let downloaded = runtime()?.block_on(ctx.service.download_cloud_backup(remote_id))?;
    options.expected_checksum = downloaded.checksum.clone();
    options.source_backup_id = downloaded.backup_id;
    let outcome = run_restore(&ctx, &downloaded.path, scope, options)?;
    ctx.save_database()?;
    write_response(&json!({ "downloaded": downloaded, "outcome": outcome }))
}

pub fn drive_status(config_path: &Path) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    write_response(&ctx.service.google_drive_status())
}

pub fn drive_auth_url(config_path: &Path, state: Option<&str>) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let url = ctx.service.google_drive_auth_url(state)?;
    write_response(&json!({ "url": url }))
}

pub fn drive_connect(config_path: &Path, code: &str) -> CliResult<()> {
    if code.trim().is_empty() {
        return Err(CliError::invalid_argument("authorization code is required"));
    }
    let ctx = Context::open(config_path)?;
    write_response(&runtime()?.block_on(ctx.service.connect_google_drive(code))?)
}

pub fn drive_disconnect(config_path: &Path) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let disconnected = ctx.service.disconnect_google_drive()?;
    write_response(&json!({ "disconnected": disconnected }))
}

/// One scheduler tick, for running from an external cron
pub fn schedule_run(config_path: &Path) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let runner = ctx.schedule_runner()?;
    let results = runtime()?.block_on(runner.tick(Utc::now()))?;
    write_response(&results)
}

pub fn serve(config_path: &Path, port: Option<u16>) -> CliResult<()> {
    let ctx = Context::open(config_path)?;
    let runner = ctx.schedule_runner()?;

    let mut http = ctx.config.http.clone();
    if let Some(port) = port {
        http.port = port;
    }

    let db = Arc::clone(&ctx.db);
    let db_path: PathBuf = ctx.config.database_path();
    let persist: RestoreHook = Arc::new(move || db.save_to_file(&db_path).map_err(|e| e.to_string()));
    let state = BackupState::new(ctx.service.clone(), runner.clone()).with_restore_hook(persist);
    let server = HttpServer::new(http, state);

    runtime()?.block_on(async move {
        let shutdown = CancellationToken::new();
        let scheduler = tokio::spawn(runner.run(shutdown.clone()));

        let signal = shutdown.clone();
        let result = server
            .start(async move {
                tokio::signal::ctrl_c().await.ok();
                signal.cancel();
            })
            .await;

        shutdown.cancel();
        if let Err(e) = scheduler.await {
            log_event(Event::ScheduleFailed, &[("reason", &e.to_string())]);
        }
        result.map_err(|e| CliError::serve_failed(format!("HTTP server failed: {}", e)))
    })?;

    write_response(&json!({ "stopped": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::checksum;
    use crate::config::ScopeConfig;
    use crate::database::{row, ColumnKind, SqlValue, TableSchema};
    use crate::records::BackupRecord;
    use crate::restore::RestoreErrorCode;
    use crate::store::MemoryStore;
    use std::fs;
    use tempfile::TempDir;

    fn context(temp: &TempDir) -> Context {
        let db = MemoryDatabase::new();
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
        let db = Arc::new(db);

        let mut config = BackupConfig::with_dirs(
            temp.path().join("backups"),
            temp.path().join("uploads"),
            temp.path().join("data"),
        );
        config.scopes = ScopeConfig::new(&["email_template"], &[]);
        let service = BackupService::new(
            config.clone(),
            db.clone(),
            Arc::new(MemoryStore::<BackupRecord>::new()),
        )
        .unwrap();
        Context {
            config,
            db,
            service,
        }
    }

    #[test]
    fn test_archive_arg_needs_exactly_one_source() {
        let id = Uuid::new_v4();
        assert_eq!(
            ArchiveArg::from_args(None, Some(id)).unwrap(),
            ArchiveArg::Backup(id)
        );
        assert!(ArchiveArg::from_args(None, None).is_err());
        assert!(ArchiveArg::from_args(Some(PathBuf::from("/a.tar.gz")), Some(id)).is_err());
    }

    #[tokio::test]
    async fn test_backup_id_uses_recorded_checksum_over_sidecar() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let record = ctx
            .service
            .create_backup(CreateBackupRequest::new(BackupScope::Settings), RunControl::new())
            .await
            .unwrap();
        let path = PathBuf::from(record.file_path.as_deref().unwrap());

        // Sidecar disagrees with the record; the record is right
        let bogus = checksum::sha256_bytes(b"something else");
        fs::write(
            checksum::sidecar_path(&path),
            checksum::sidecar_contents(&bogus, &path),
        )
        .unwrap();

        let by_path = ctx.resolve(&ArchiveArg::Path(path.clone()), None).unwrap();
        assert!(by_path.checksum.is_none());
        let report = ctx
            .service
            .validate_archive(&by_path.path, by_path.checksum.as_deref())
            .await
            .unwrap();
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == RestoreErrorCode::ChecksumMismatch));

        let by_id = ctx.resolve(&ArchiveArg::Backup(record.id), None).unwrap();
        assert_eq!(by_id.path, path);
        assert_eq!(by_id.checksum, record.checksum);
        assert_eq!(by_id.backup_id, Some(record.id));
        let report = ctx
            .service
            .validate_archive(&by_id.path, by_id.checksum.as_deref())
            .await
            .unwrap();
        assert!(report.valid, "{:?}", report.errors);

        // An explicit checksum still wins
        let explicit = ctx
            .resolve(&ArchiveArg::Backup(record.id), Some(bogus.clone()))
            .unwrap();
        assert_eq!(explicit.checksum, Some(bogus));
    }

    #[test]
    fn test_unknown_backup_id_is_not_found() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let err = ctx
            .resolve(&ArchiveArg::Backup(Uuid::new_v4()), None)
            .unwrap_err();
        assert_eq!(err.code_str(), "NEXUS_BACKUP_NOT_FOUND");
    }
}
