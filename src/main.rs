//! nexus-backup entry point
//!
//! Argument parsing, configuration and every command live in `cli`; this
//! only maps a failure to a non-zero exit status.

use nexus_backup::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
