//! ObservationScope for automatic begin/complete logging
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` with `duration_ms` on `complete()`
//! - Logs `{name}_FAILED` on `fail()`
//! - Logs `{name}_INCOMPLETE` if dropped without either

use std::time::Instant;

use super::logger::Logger;

/// A scope that logs the begin and outcome of a run
///
/// ```ignore
/// let scope = ObservationScope::with_fields("BACKUP", &[("scope", "full")]);
/// // ... do work ...
/// scope.complete_with_fields(&[("tables", "12")]);
/// ```
pub struct ObservationScope {
    name: String,
    fields: Vec<(String, String)>,
    started: Instant,
    finished: bool,
}

impl ObservationScope {
    /// Create a scope and log `{name}_BEGIN`
    pub fn new(name: &str) -> Self {
        Self::with_fields(name, &[])
    }

    /// Create a scope whose fields are repeated on every line it logs
    pub fn with_fields(name: &str, fields: &[(&str, &str)]) -> Self {
        Logger::info(&format!("{}_BEGIN", name), fields);
        Self {
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Milliseconds since the scope began
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Log `{name}_COMPLETE`
    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    /// Log `{name}_COMPLETE` with extra fields
    pub fn complete_with_fields(mut self, extra: &[(&str, &str)]) {
        self.finished = true;
        let duration = self.elapsed_ms().to_string();
        let mut fields = self.base_fields();
        fields.extend(extra.iter().copied());
        fields.push(("duration_ms", duration.as_str()));
        Logger::info(&format!("{}_COMPLETE", self.name), &fields);
    }

    /// Log `{name}_FAILED` at ERROR
    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        let mut fields = self.base_fields();
        fields.push(("reason", reason));
        Logger::error(&format!("{}_FAILED", self.name), &fields);
    }

    fn base_fields(&self) -> Vec<(&str, &str)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.finished {
            let fields = self.base_fields();
            Logger::warn(&format!("{}_INCOMPLETE", self.name), &fields);
        }
    }
}
