//! Shared fixture for the integration tests
//!
//! Builds a small practice database: two settings tables, three data
//! tables linked by foreign keys, and a couple of uploaded files.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use nexus_backup::config::{BackupConfig, ScopeConfig};
use nexus_backup::database::{row, ColumnKind, MemoryDatabase, SqlValue, TableSchema};
use nexus_backup::records::BackupRecord;
use nexus_backup::service::BackupService;
use nexus_backup::store::MemoryStore;

pub const SETTINGS_TABLES: [&str; 2] = ["email_template", "service_catalog"];
pub const DATA_TABLES: [&str; 3] = ["client", "matter", "invoice"];

pub fn all_tables() -> Vec<&'static str> {
    SETTINGS_TABLES.iter().chain(DATA_TABLES.iter()).copied().collect()
}

pub fn schemas() -> Vec<TableSchema> {
    vec![
        TableSchema::new("email_template", "id", ColumnKind::Integer)
            .column("subject", ColumnKind::Text)
            .column("body", ColumnKind::Text),
        TableSchema::new("service_catalog", "id", ColumnKind::Integer)
            .column("name", ColumnKind::Text)
            .column("rate", ColumnKind::Float),
        TableSchema::new("client", "id", ColumnKind::Integer)
            .column("name", ColumnKind::Text)
            .column("created_at", ColumnKind::Timestamp)
            .column("active", ColumnKind::Boolean),
        TableSchema::new("matter", "id", ColumnKind::Integer)
            .column("client_id", ColumnKind::Integer)
            .column("service_id", ColumnKind::Integer)
            .column("title", ColumnKind::Text)
            .foreign_key("client_id", "client", "id")
            .foreign_key("service_id", "service_catalog", "id"),
        TableSchema::new("invoice", "id", ColumnKind::Integer)
            .column("matter_id", ColumnKind::Integer)
            .column("amount", ColumnKind::Float)
            .nullable_column("meta", ColumnKind::Json)
            .foreign_key("matter_id", "matter", "id"),
    ]
}

/// Tables only, no rows
pub fn empty_database() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    for schema in schemas() {
        db.create_table(schema).unwrap();
    }
    db
}

pub fn seeded_database() -> MemoryDatabase {
    let db = empty_database();
    let created = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();

    for (id, subject) in [(1, "Welcome"), (2, "Invoice due")] {
        db.insert(
            "email_template",
            row([
                ("id", SqlValue::from(id)),
                ("subject", subject.into()),
                ("body", format!("Dear client, {}", subject).into()),
            ]),
        )
        .unwrap();
    }
    for id in 1..=5i64 {
        db.insert(
            "service_catalog",
            row([
                ("id", SqlValue::from(id)),
                ("name", format!("Service {}", id).into()),
                ("rate", (id as f64 * 12.5).into()),
            ]),
        )
        .unwrap();
    }
    for (id, name, active) in [(1, "Acme", true), (2, "Globex", false)] {
        db.insert(
            "client",
            row([
                ("id", SqlValue::from(id)),
                ("name", name.into()),
                ("created_at", created.into()),
                ("active", active.into()),
            ]),
        )
        .unwrap();
    }
    for (id, client_id, service_id) in [(10, 1, 1), (11, 1, 3), (12, 2, 5)] {
        db.insert(
            "matter",
            row([
                ("id", SqlValue::from(id)),
                ("client_id", client_id.into()),
                ("service_id", service_id.into()),
                ("title", format!("Matter {}", id).into()),
            ]),
        )
        .unwrap();
    }
    db.insert(
        "invoice",
        row([
            ("id", SqlValue::from(100)),
            ("matter_id", 10.into()),
            ("amount", 250.75.into()),
            ("meta", SqlValue::Json(json!({"terms": "net30", "lines": [1, 2]}))),
        ]),
    )
    .unwrap();
    db.insert(
        "invoice",
        row([
            ("id", SqlValue::from(101)),
            ("matter_id", 12.into()),
            ("amount", 99.0.into()),
            ("meta", SqlValue::Null),
        ]),
    )
    .unwrap();
    db
}

pub fn scope_config() -> ScopeConfig {
    ScopeConfig::new(&SETTINGS_TABLES, &DATA_TABLES)
}

pub fn config_in(root: &Path) -> BackupConfig {
    let mut config = BackupConfig::with_dirs(
        root.join("backups"),
        root.join("uploads"),
        root.join("data"),
    );
    config.scopes = scope_config();
    config
}

pub fn write_uploads(dir: &Path) {
    fs::create_dir_all(dir.join("documents/2024")).unwrap();
    fs::write(dir.join("logo.png"), b"\x89PNG fake image").unwrap();
    fs::write(dir.join("documents/2024/engagement.pdf"), b"%PDF-1.4 letter").unwrap();
}

pub struct Fixture {
    pub temp: TempDir,
    pub db: Arc<MemoryDatabase>,
    pub service: BackupService,
}

impl Fixture {
    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.service.config().backup_dir.clone()
    }
}

/// Service over `db` with an in-memory record store
pub fn fixture_with(db: MemoryDatabase) -> Fixture {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    write_uploads(&config.uploads_dir);
    let db = Arc::new(db);
    let service = BackupService::new(
        config,
        db.clone(),
        Arc::new(MemoryStore::<BackupRecord>::new()),
    )
    .unwrap();
    Fixture { temp, db, service }
}

pub fn fixture() -> Fixture {
    fixture_with(seeded_database())
}

/// Second service over a schema-only database with its own directories
pub fn empty_target() -> Fixture {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let db = Arc::new(empty_database());
    let service = BackupService::new(
        config,
        db.clone(),
        Arc::new(MemoryStore::<BackupRecord>::new()),
    )
    .unwrap();
    Fixture { temp, db, service }
}

pub fn snapshot(db: &MemoryDatabase, tables: &[&str]) -> Vec<(String, Vec<nexus_backup::database::Row>)> {
    tables
        .iter()
        .map(|t| (t.to_string(), db.rows(t).unwrap()))
        .collect()
}
