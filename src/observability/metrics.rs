//! Operational counters for backup and restore runs
//!
//! Counters only, monotonic, reset on process start.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters shared by the service, the scheduler and the HTTP layer
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    backups_started: AtomicU64,
    backups_completed: AtomicU64,
    backups_failed: AtomicU64,
    restores_completed: AtomicU64,
    restores_failed: AtomicU64,
    rows_dumped: AtomicU64,
    rows_restored: AtomicU64,
    archive_bytes_written: AtomicU64,
    cloud_syncs_completed: AtomicU64,
    cloud_syncs_failed: AtomicU64,
    concurrent_rejections: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_started(&self) {
        self.backups_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished backup with its row and byte totals
    pub fn backup_completed(&self, rows: u64, bytes: u64) {
        self.backups_completed.fetch_add(1, Ordering::Relaxed);
        self.rows_dumped.fetch_add(rows, Ordering::Relaxed);
        self.archive_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn backup_failed(&self) {
        self.backups_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restore_completed(&self, rows: u64) {
        self.restores_completed.fetch_add(1, Ordering::Relaxed);
        self.rows_restored.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn restore_failed(&self) {
        self.restores_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cloud_sync(&self, ok: bool) {
        if ok {
            self.cloud_syncs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cloud_syncs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn concurrent_rejected(&self) {
        self.concurrent_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backups_started: self.backups_started.load(Ordering::Relaxed),
            backups_completed: self.backups_completed.load(Ordering::Relaxed),
            backups_failed: self.backups_failed.load(Ordering::Relaxed),
            restores_completed: self.restores_completed.load(Ordering::Relaxed),
            restores_failed: self.restores_failed.load(Ordering::Relaxed),
            rows_dumped: self.rows_dumped.load(Ordering::Relaxed),
            rows_restored: self.rows_restored.load(Ordering::Relaxed),
            archive_bytes_written: self.archive_bytes_written.load(Ordering::Relaxed),
            cloud_syncs_completed: self.cloud_syncs_completed.load(Ordering::Relaxed),
            cloud_syncs_failed: self.cloud_syncs_failed.load(Ordering::Relaxed),
            concurrent_rejections: self.concurrent_rejections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub backups_started: u64,
    pub backups_completed: u64,
    pub backups_failed: u64,
    pub restores_completed: u64,
    pub restores_failed: u64,
    pub rows_dumped: u64,
    pub rows_restored: u64,
    pub archive_bytes_written: u64,
    pub cloud_syncs_completed: u64,
    pub cloud_syncs_failed: u64,
    pub concurrent_rejections: u64,
}
