//! Operator CLI
//!
//! Every command prints a single JSON object on stdout:
//! - backup, validate, restore, preview (archive path or `--id`)
//! - list, stats, delete, cleanup-failed, disk-files
//! - cloud-list, cloud-test, cloud-download, cloud-delete, cloud-restore
//! - drive-status, drive-auth-url, drive-connect, drive-disconnect
//! - schedule-run: one scheduler tick
//! - serve: HTTP API plus the schedule runner

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
