//! CLI argument definitions using clap
//!
//! Commands:
//! - nexus-backup backup --scope <scope>
//! - nexus-backup validate <archive> | --id <backup>
//! - nexus-backup restore <archive> | --id <backup> --scope <scope> --strategy <strategy>
//! - nexus-backup preview <archive> | --id <backup> --scope <scope>
//! - nexus-backup list | stats | delete | cleanup-failed | disk-files
//! - nexus-backup cloud-list | cloud-test | cloud-download | cloud-delete | cloud-restore
//! - nexus-backup drive-status | drive-auth-url | drive-connect | drive-disconnect
//! - nexus-backup schedule-run
//! - nexus-backup serve

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

const DEFAULT_CONFIG: &str = "./nexus-backup.json";

/// Scoped backup and restore for GK-Nexus
#[derive(Parser, Debug)]
#[command(name = "nexus-backup")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a backup archive
    Backup {
        /// Path to configuration file
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// settings, data, database or full
        #[arg(long, default_value = "full")]
        scope: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        created_by: Option<String>,

        /// Upload the archive to the configured provider afterwards
        #[arg(long)]
        sync: bool,
    },

    /// Validate an archive without touching live data
    Validate {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        #[arg(required_unless_present = "id", conflicts_with = "id")]
        archive: Option<PathBuf>,

        /// Completed backup whose archive and recorded checksum to use
        #[arg(long)]
        id: Option<Uuid>,

        /// Overrides the .sha256 sidecar
        #[arg(long)]
        checksum: Option<String>,
    },

    /// Restore an archive into the live database
    Restore {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        #[arg(required_unless_present = "id", conflicts_with = "id")]
        archive: Option<PathBuf>,

        /// Completed backup whose archive and recorded checksum to use
        #[arg(long)]
        id: Option<Uuid>,

        /// Target scope; must be contained in the archive's scope
        #[arg(long)]
        scope: String,

        /// replace or merge
        #[arg(long, default_value = "merge")]
        strategy: String,

        /// Take a pre-restore safety backup first
        #[arg(long)]
        safety_backup: bool,

        /// Use an existing completed backup as the safety backup
        #[arg(long)]
        safety_backup_id: Option<Uuid>,

        /// Replace without any safety backup
        #[arg(long)]
        force: bool,

        /// Proceed despite validation warnings
        #[arg(long)]
        acknowledge_warnings: bool,

        #[arg(long)]
        checksum: Option<String>,

        #[arg(long)]
        created_by: Option<String>,
    },

    /// Show what a restore would change
    Preview {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        #[arg(required_unless_present = "id", conflicts_with = "id")]
        archive: Option<PathBuf>,

        /// Completed backup whose archive and recorded checksum to use
        #[arg(long)]
        id: Option<Uuid>,

        #[arg(long)]
        scope: String,

        #[arg(long)]
        checksum: Option<String>,
    },

    /// List backup records, newest first
    List {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// pending, in_progress, completed or failed
        #[arg(long)]
        status: Option<String>,

        /// manual, scheduled, pre_update or pre_restore
        #[arg(long = "type")]
        backup_type: Option<String>,

        #[arg(long)]
        scope: Option<String>,

        /// Earliest created_at (RFC 3339)
        #[arg(long)]
        start_date: Option<DateTime<Utc>>,

        /// Latest created_at (RFC 3339)
        #[arg(long)]
        end_date: Option<DateTime<Utc>>,

        /// 1-based page; prints a page with totals instead of a list
        #[arg(long)]
        page: Option<usize>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Record totals, or what a backup of a scope would contain
    Stats {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        #[arg(long)]
        scope: Option<String>,
    },

    /// Delete a backup record
    Delete {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        id: Uuid,

        /// Also remove the archive and its checksum
        #[arg(long)]
        delete_file: bool,
    },

    /// Remove failed records and any leftover partial archives
    CleanupFailed {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// List archive files in the backup directory
    DiskFiles {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Archives held by the configured cloud provider
    CloudList {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Check the cloud provider's credentials
    CloudTest {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Copy a remote archive into the backup directory
    CloudDownload {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        remote_id: String,
    },

    /// Delete a remote archive
    CloudDelete {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        remote_id: String,
    },

    /// Download a remote archive and restore it
    CloudRestore {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        remote_id: String,

        #[arg(long)]
        scope: String,

        #[arg(long, default_value = "merge")]
        strategy: String,

        #[arg(long)]
        safety_backup: bool,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        acknowledge_warnings: bool,

        #[arg(long)]
        created_by: Option<String>,
    },

    /// Google Drive connection state
    DriveStatus {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Print the Google consent URL
    DriveAuthUrl {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        #[arg(long)]
        state: Option<String>,
    },

    /// Exchange an authorization code for stored tokens
    DriveConnect {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        code: String,
    },

    /// Forget the stored Google Drive tokens
    DriveDisconnect {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Run every due schedule once
    ScheduleRun {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Start the HTTP API and the schedule runner
    Serve {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Overrides http.port from the configuration
        #[arg(long)]
        port: Option<u16>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_defaults() {
        let cli = Cli::try_parse_from(["nexus-backup", "backup"]).unwrap();
        match cli.command {
            Command::Backup {
                config, scope, sync, ..
            } => {
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
                assert_eq!(scope, "full");
                assert!(!sync);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_restore_flags() {
        let cli = Cli::try_parse_from([
            "nexus-backup",
            "restore",
            "/tmp/a.tar.gz",
            "--scope",
            "settings",
            "--strategy",
            "replace",
            "--safety-backup",
            "--acknowledge-warnings",
        ])
        .unwrap();
        match cli.command {
            Command::Restore {
                archive,
                scope,
                strategy,
                safety_backup,
                acknowledge_warnings,
                force,
                ..
            } => {
                assert_eq!(archive, Some(PathBuf::from("/tmp/a.tar.gz")));
                assert_eq!(scope, "settings");
                assert_eq!(strategy, "replace");
                assert!(safety_backup);
                assert!(acknowledge_warnings);
                assert!(!force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_restore_requires_scope() {
        assert!(Cli::try_parse_from(["nexus-backup", "restore", "/tmp/a.tar.gz"]).is_err());
    }

    #[test]
    fn test_kebab_case_subcommands() {
        assert!(Cli::try_parse_from(["nexus-backup", "cleanup-failed"]).is_ok());
        assert!(Cli::try_parse_from(["nexus-backup", "disk-files"]).is_ok());
        assert!(Cli::try_parse_from(["nexus-backup", "schedule-run"]).is_ok());
    }

    #[test]
    fn test_archive_or_id() {
        let id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from(["nexus-backup", "validate", "--id", id.as_str()]).unwrap();
        match cli.command {
            Command::Validate { archive, id: Some(parsed), .. } => {
                assert!(archive.is_none());
                assert_eq!(parsed.to_string(), id);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Cli::try_parse_from(["nexus-backup", "validate"]).is_err());
        assert!(Cli::try_parse_from([
            "nexus-backup",
            "preview",
            "/tmp/a.tar.gz",
            "--id",
            id.as_str(),
            "--scope",
            "settings",
        ])
        .is_err());
    }

    #[test]
    fn test_list_filters() {
        let cli = Cli::try_parse_from([
            "nexus-backup",
            "list",
            "--scope",
            "data",
            "--start-date",
            "2026-01-01T00:00:00Z",
            "--page",
            "2",
        ])
        .unwrap();
        match cli.command {
            Command::List {
                scope,
                start_date,
                page,
                ..
            } => {
                assert_eq!(scope.as_deref(), Some("data"));
                assert_eq!(start_date.unwrap().to_rfc3339(), "2026-01-01T00:00:00+00:00");
                assert_eq!(page, Some(2));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cloud_and_drive_subcommands() {
        assert!(Cli::try_parse_from(["nexus-backup", "cloud-list"]).is_ok());
        assert!(Cli::try_parse_from(["nexus-backup", "cloud-download", "backups/a.tar.gz"]).is_ok());
        assert!(Cli::try_parse_from(["nexus-backup", "cloud-restore", "abc"]).is_err());
        assert!(Cli::try_parse_from(["nexus-backup", "cloud-restore", "abc", "--scope", "data"]).is_ok());
        assert!(Cli::try_parse_from(["nexus-backup", "drive-status"]).is_ok());
        assert!(Cli::try_parse_from(["nexus-backup", "drive-auth-url", "--state", "x"]).is_ok());
        assert!(Cli::try_parse_from(["nexus-backup", "drive-connect"]).is_err());
        assert!(Cli::try_parse_from(["nexus-backup", "drive-disconnect"]).is_ok());
    }
}
