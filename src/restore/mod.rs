//! Restore subsystem
//!
//! Restore applies a backup archive to the live database in two stages.
//!
//! # Validation
//!
//! `RestoreValidator` checks the archive checksum, extracts it into a
//! private directory, verifies every entry against the embedded manifest,
//! recovers the scope the entries imply and compares versions with the
//! running system. It never changes live state.
//!
//! # Application
//!
//! `RestoreExecutor` applies a validated archive:
//!
//! 1. Target scope must be contained in the archive scope
//! 2. `replace` requires a verified safety backup or an explicit override
//! 3. Every table file is decoded up front
//! 4. Enter the destructive phase (cancellation refused from here on)
//! 5. `replace`: delete children first, then insert parents first
//!    `merge`: upsert by primary key, parents first
//! 6. Copy uploaded files when the target scope is `full`
//!
//! The first failing table stops the run. The error names the table and
//! how many tables and rows were applied before it.

mod errors;
mod executor;
mod extractor;
mod validator;

pub use errors::{RestoreError, RestoreErrorCode, RestoreProgress, RestoreResult};
pub use executor::{
    ProgressCallback, RestoreExecutor, RestorePhase, RestorePlan, RestoreProgressEvent,
    RestoreStatus, RestoreStrategy, RestoreSummary, TableResult,
};
pub use extractor::{extract_archive, ExtractedArchive};
pub use validator::{
    ManifestSummary, RestoreValidator, TableSummary, UploadsReport, ValidatedArchive,
    ValidationIssue, ValidationReport, ValidationWarning, WarningKind,
};
