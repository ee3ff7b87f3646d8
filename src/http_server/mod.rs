//! # HTTP admin API
//!
//! - `/health` - Health check
//! - `/backup/*` - Backups, restores and schedules

pub mod backup_routes;
pub mod config;
pub mod server;

pub use backup_routes::{backup_routes, BackupState, RestoreHook};
pub use config::HttpServerConfig;
pub use server::HttpServer;
