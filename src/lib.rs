//! nexus-backup - scoped backup and restore for GK-Nexus
//!
//! Dumps database tables (and, for `full`, the uploads tree) into a
//! checksummed tar.gz archive, keeps an audit record per backup, syncs
//! archives to cloud storage, runs cron schedules with retention, and
//! restores archives with validation and a pre-restore safety backup.

pub mod backup;
pub mod cli;
pub mod cloud;
pub mod config;
pub mod database;
pub mod fs_util;
pub mod http_server;
pub mod lock;
pub mod observability;
pub mod records;
pub mod restore;
pub mod schedule;
pub mod scope;
pub mod service;
pub mod store;
