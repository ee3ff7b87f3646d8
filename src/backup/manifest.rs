//! Backup manifest
//!
//! Stored inside the archive as `backup_manifest.json`. It makes an
//! archive self-describing: declared scope, versions, the schema and row
//! count of every table, per-entry checksums, and the uploaded files.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{BackupError, BackupResult};
use crate::database::TableSchema;
use crate::scope::{BackupScope, TableGroup};

/// Highest archive layout this build reads and the one it writes
pub const FORMAT_VERSION: u32 = 1;

/// Prefix of uploaded-file entries inside the archive
pub const UPLOADS_PREFIX: &str = "uploads/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableEntry {
    pub schema: TableSchema,
    pub group: TableGroup,
    pub row_count: u64,
    /// Digest of the `<table>.json` entry
    pub sha256: String,
}

impl TableEntry {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Archive entry holding this table's rows
    pub fn entry_name(&self) -> String {
        table_entry_name(&self.schema.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadEntry {
    /// Path relative to the uploads directory, `/`-separated
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

impl UploadEntry {
    pub fn entry_name(&self) -> String {
        format!("{}{}", UPLOADS_PREFIX, self.path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadsSummary {
    pub included: bool,
    pub file_count: u64,
    pub total_size: u64,
    #[serde(default)]
    pub files: Vec<UploadEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub format_version: u32,
    pub backup_id: String,
    pub name: String,
    pub scope: BackupScope,
    /// RFC 3339
    pub created_at: String,
    pub app_version: String,
    pub schema_version: String,
    /// Parent tables before child tables
    pub tables: Vec<TableEntry>,
    #[serde(default)]
    pub uploads: UploadsSummary,
}

impl BackupManifest {
    pub fn new(
        backup_id: &str,
        name: &str,
        scope: BackupScope,
        created_at: DateTime<Utc>,
        app_version: &str,
        schema_version: &str,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            backup_id: backup_id.to_string(),
            name: name.to_string(),
            scope,
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            app_version: app_version.to_string(),
            schema_version: schema_version.to_string(),
            tables: Vec::new(),
            uploads: UploadsSummary {
                included: scope.includes_uploads(),
                ..UploadsSummary::default()
            },
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableEntry> {
        self.tables.iter().find(|t| t.schema.name == name)
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.row_count).sum()
    }

    /// Every entry name the archive must contain besides the manifest
    pub fn expected_entries(&self) -> HashSet<String> {
        self.tables
            .iter()
            .map(|t| t.entry_name())
            .chain(self.uploads.files.iter().map(|f| f.entry_name()))
            .collect()
    }

    pub fn groups(&self) -> Vec<TableGroup> {
        self.tables.iter().map(|t| t.group).collect()
    }

    pub fn to_json(&self) -> BackupResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            BackupError::archive_write_msg(format!("Failed to serialize backup manifest: {}", e))
        })
    }

    /// Parse a manifest; the error text is surfaced in validation reports
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Failed to parse backup manifest: {}", e))
    }
}

pub fn table_entry_name(table: &str) -> String {
    format!("{}.json", table)
}
