//! Observability for the backup pipeline
//!
//! - Structured JSON logging
//! - Typed lifecycle events
//! - Begin/complete scopes around whole runs
//! - Atomic counters
//!
//! ```ignore
//! use nexus_backup::observability::{log_event, Event, ObservationScope};
//!
//! let scope = ObservationScope::with_fields("BACKUP", &[("scope", "data")]);
//! log_event(Event::TableDumped, &[("table", "client"), ("rows", "42")]);
//! scope.complete();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::ObservationScope;

/// Log a lifecycle event at its own severity
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_does_not_panic() {
        log_event(Event::ConfigLoaded, &[("backup_dir", "/tmp/backups")]);
        log_event(Event::CloudSyncFailed, &[("reason", "timeout")]);
    }
}
