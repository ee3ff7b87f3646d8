//! Archive validation
//!
//! Runs before anything destructive and never changes live state:
//!
//! 1. Recompute the archive checksum and compare it with the recorded
//!    value (caller-supplied, else the `.sha256` sidecar)
//! 2. Extract into a private directory and read the manifest
//! 3. Verify every table and upload entry against its manifest digest
//! 4. Recover the implied scope from the entry list
//! 5. Compare archive versions with the live system
//!
//! Failures are collected into the report rather than returned, so
//! operators see every problem at once. A checksum mismatch stops
//! validation immediately: nothing else in a corrupt archive is trusted.

use std::fs;
use std::path::Path;

use serde::Serialize;

use super::errors::{RestoreErrorCode, RestoreError};
use super::extractor::{extract_archive, ExtractedArchive};
use crate::backup::{checksum, BackupManifest, FORMAT_VERSION, UPLOADS_PREFIX};
use crate::config::{version_major, MANIFEST_ENTRY};
use crate::observability::{log_event, Event};
use crate::scope::{BackupScope, TableGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Archive from a newer major app version or another schema version
    VersionIncompatibility,
    /// No recorded checksum to compare against
    ChecksumUnverified,
    /// Declared scope differs from what the entries imply
    ScopeMismatch,
    /// Archive table absent from the live database
    MissingLiveTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationWarning {
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub code: RestoreErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub group: TableGroup,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestSummary {
    pub backup_id: String,
    pub name: String,
    pub created_at: String,
    pub app_version: String,
    pub schema_version: String,
    pub format_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadsReport {
    pub included: bool,
    pub file_count: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub archive_path: String,
    pub file_size: u64,
    /// Computed over the compressed bytes
    pub checksum: Option<String>,
    pub expected_checksum: Option<String>,
    /// Declared in the manifest
    pub scope: Option<BackupScope>,
    /// Recovered from the entry list
    pub implied_scope: Option<BackupScope>,
    pub tables: Vec<TableSummary>,
    pub total_rows: u64,
    pub uploads: UploadsReport,
    pub manifest: Option<ManifestSummary>,
    pub warnings: Vec<ValidationWarning>,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn new(path: &Path) -> Self {
        Self {
            valid: false,
            archive_path: path.display().to_string(),
            file_size: 0,
            checksum: None,
            expected_checksum: None,
            scope: None,
            implied_scope: None,
            tables: Vec::new(),
            total_rows: 0,
            uploads: UploadsReport::default(),
            manifest: None,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn error(&mut self, code: RestoreErrorCode, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            code,
            message: message.into(),
        });
    }

    fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        self.warnings.push(ValidationWarning {
            kind,
            message: message.into(),
        });
    }

    /// Warnings must be acknowledged before a restore may apply
    pub fn requires_acknowledgment(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// The first error as a typed restore error
    pub fn first_error(&self) -> Option<RestoreError> {
        self.errors
            .first()
            .map(|issue| RestoreError::from_issue(issue.code, &issue.message))
    }

    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }
}

/// A valid archive, extracted and ready to apply
#[derive(Debug)]
pub struct ValidatedArchive {
    pub manifest: BackupManifest,
    pub extracted: ExtractedArchive,
}

/// Live-system facts validation compares against
#[derive(Debug, Clone)]
pub struct RestoreValidator {
    work_dir: std::path::PathBuf,
    app_version: String,
    schema_version: String,
    /// `None` skips the live-table check
    live_tables: Option<Vec<String>>,
}

impl RestoreValidator {
    pub fn new(
        work_dir: impl Into<std::path::PathBuf>,
        app_version: impl Into<String>,
        schema_version: impl Into<String>,
        live_tables: Option<Vec<String>>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            app_version: app_version.into(),
            schema_version: schema_version.into(),
            live_tables,
        }
    }

    /// Validate without keeping the extraction
    pub fn validate(&self, path: &Path, expected_checksum: Option<&str>) -> ValidationReport {
        self.inspect(path, expected_checksum).0
    }

    /// Validate and, when valid, hand back the extracted archive
    pub fn inspect(
        &self,
        path: &Path,
        expected_checksum: Option<&str>,
    ) -> (ValidationReport, Option<ValidatedArchive>) {
        let mut report = ValidationReport::new(path);
        let validated = self.run_checks(path, expected_checksum, &mut report);
        report.valid = report.errors.is_empty();

        log_event(
            Event::RestoreValidated,
            &[
                ("archive", &report.archive_path),
                ("valid", if report.valid { "true" } else { "false" }),
                ("warnings", &report.warnings.len().to_string()),
                ("errors", &report.errors.len().to_string()),
            ],
        );
        for warning in &report.warnings {
            log_event(
                Event::RestoreWarning,
                &[("archive", &report.archive_path), ("warning", &warning.message)],
            );
        }

        if report.valid {
            (report, validated)
        } else {
            (report, None)
        }
    }

    fn run_checks(
        &self,
        path: &Path,
        expected_checksum: Option<&str>,
        report: &mut ValidationReport,
    ) -> Option<ValidatedArchive> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => report.file_size = meta.len(),
            Ok(_) => {
                report.error(
                    RestoreErrorCode::InvalidArchive,
                    format!("Not a file: {}", path.display()),
                );
                return None;
            }
            Err(e) => {
                report.error(
                    RestoreErrorCode::InvalidArchive,
                    format!("Cannot read archive {}: {}", path.display(), e),
                );
                return None;
            }
        }

        // 1. Checksum over the compressed bytes
        let actual = match checksum::sha256_file(path) {
            Ok(sum) => sum,
            Err(e) => {
                report.error(
                    RestoreErrorCode::Io,
                    format!("Failed to checksum archive: {}", e),
                );
                return None;
            }
        };
        report.checksum = Some(actual.clone());

        let expected = expected_checksum
            .map(|s| s.trim().to_ascii_lowercase())
            .or_else(|| checksum::read_sidecar(path));
        report.expected_checksum = expected.clone();
        match expected {
            Some(expected) if expected != actual => {
                report.error(
                    RestoreErrorCode::ChecksumMismatch,
                    format!(
                        "Archive checksum mismatch: expected {}, computed {}",
                        expected, actual
                    ),
                );
                return None;
            }
            Some(_) => {}
            None => report.warn(
                WarningKind::ChecksumUnverified,
                "No recorded checksum found; archive integrity could not be verified",
            ),
        }

        // 2. Extract and read the manifest
        let extracted = match extract_archive(path, &self.work_dir) {
            Ok(extracted) => extracted,
            Err(e) => {
                report.error(e.code(), e.message().to_string());
                return None;
            }
        };
        if !extracted.contains(MANIFEST_ENTRY) {
            report.error(
                RestoreErrorCode::InvalidArchive,
                format!("Archive has no {}", MANIFEST_ENTRY),
            );
            return None;
        }
        let manifest = match fs::read_to_string(extracted.path_of(MANIFEST_ENTRY))
            .map_err(|e| e.to_string())
            .and_then(|json| BackupManifest::from_json(&json))
        {
            Ok(manifest) => manifest,
            Err(e) => {
                report.error(RestoreErrorCode::InvalidArchive, e);
                return None;
            }
        };
        self.summarize(&manifest, report);

        if manifest.format_version > FORMAT_VERSION {
            report.error(
                RestoreErrorCode::InvalidArchive,
                format!(
                    "Archive format version {} is newer than supported version {}",
                    manifest.format_version, FORMAT_VERSION
                ),
            );
            return None;
        }

        // 3. Entries against manifest digests
        for table in &manifest.tables {
            verify_entry(&extracted, &table.entry_name(), &table.sha256, report);
        }
        for upload in &manifest.uploads.files {
            verify_entry(&extracted, &upload.entry_name(), &upload.sha256, report);
        }
        let expected_entries = manifest.expected_entries();
        for entry in extracted.entries() {
            if entry != MANIFEST_ENTRY && !expected_entries.contains(entry) {
                report.error(
                    RestoreErrorCode::InvalidArchive,
                    format!("Unexpected archive entry not listed in manifest: {}", entry),
                );
            }
        }

        // 4. Scope implied by the entries
        let has_uploads = extracted
            .entries()
            .iter()
            .any(|e| e.starts_with(UPLOADS_PREFIX));
        let implied = BackupScope::implied_by(&manifest.groups(), has_uploads);
        report.implied_scope = Some(implied);
        if !manifest.scope.includes(implied) && !manifest.tables.is_empty() {
            report.error(
                RestoreErrorCode::InvalidArchive,
                format!(
                    "Archive declares scope '{}' but its entries imply '{}'",
                    manifest.scope, implied
                ),
            );
        } else if implied != manifest.scope && !empty_full(&manifest, implied) {
            report.warn(
                WarningKind::ScopeMismatch,
                format!(
                    "Archive declares scope '{}' but only contains data for '{}'",
                    manifest.scope, implied
                ),
            );
        }

        // 5. Versions and live tables
        self.compare_versions(&manifest, report);
        if let Some(live) = &self.live_tables {
            for table in &manifest.tables {
                if !live.iter().any(|t| t == table.name()) {
                    report.warn(
                        WarningKind::MissingLiveTable,
                        format!("Table {} does not exist in the live database", table.name()),
                    );
                }
            }
        }

        if report.errors.is_empty() {
            Some(ValidatedArchive {
                manifest,
                extracted,
            })
        } else {
            None
        }
    }

    fn summarize(&self, manifest: &BackupManifest, report: &mut ValidationReport) {
        report.scope = Some(manifest.scope);
        report.tables = manifest
            .tables
            .iter()
            .map(|t| TableSummary {
                name: t.name().to_string(),
                group: t.group,
                row_count: t.row_count,
            })
            .collect();
        report.total_rows = manifest.total_rows();
        report.uploads = UploadsReport {
            included: manifest.uploads.included,
            file_count: manifest.uploads.file_count,
            total_size: manifest.uploads.total_size,
        };
        report.manifest = Some(ManifestSummary {
            backup_id: manifest.backup_id.clone(),
            name: manifest.name.clone(),
            created_at: manifest.created_at.clone(),
            app_version: manifest.app_version.clone(),
            schema_version: manifest.schema_version.clone(),
            format_version: manifest.format_version,
        });
    }

    fn compare_versions(&self, manifest: &BackupManifest, report: &mut ValidationReport) {
        match (
            version_major(&manifest.app_version),
            version_major(&self.app_version),
        ) {
            (Some(archive), Some(live)) if archive > live => report.warn(
                WarningKind::VersionIncompatibility,
                format!(
                    "Archive was created by app version {} which is newer than the running {}",
                    manifest.app_version, self.app_version
                ),
            ),
            (None, _) => report.warn(
                WarningKind::VersionIncompatibility,
                format!("Archive app version '{}' is not recognized", manifest.app_version),
            ),
            _ => {}
        }

        if manifest.schema_version != self.schema_version {
            report.warn(
                WarningKind::VersionIncompatibility,
                format!(
                    "Archive schema version {} differs from live schema version {}",
                    manifest.schema_version, self.schema_version
                ),
            );
        }
    }
}

/// A full backup of an empty uploads tree looks like `database`
fn empty_full(manifest: &BackupManifest, implied: BackupScope) -> bool {
    manifest.scope == BackupScope::Full
        && implied == BackupScope::Database
        && manifest.uploads.files.is_empty()
}

fn verify_entry(
    extracted: &ExtractedArchive,
    entry: &str,
    expected: &str,
    report: &mut ValidationReport,
) {
    if !extracted.contains(entry) {
        report.error(
            RestoreErrorCode::InvalidArchive,
            format!("Archive is missing entry listed in manifest: {}", entry),
        );
        return;
    }
    match checksum::sha256_file(&extracted.path_of(entry)) {
        Ok(actual) if actual == expected => {}
        Ok(actual) => report.error(
            RestoreErrorCode::ChecksumMismatch,
            format!(
                "Entry {} checksum mismatch: expected {}, computed {}",
                entry, expected, actual
            ),
        ),
        Err(e) => report.error(
            RestoreErrorCode::Io,
            format!("Failed to checksum entry {}: {}", entry, e),
        ),
    }
}
