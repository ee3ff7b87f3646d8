//! Table dumper
//!
//! Streams a table out of a `RowSource` into `<table>.json` inside the
//! staging directory, one row at a time. The file is a JSON array of row
//! objects; its digest and row count are collected while writing.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::checksum::HashingWriter;
use super::errors::{BackupError, BackupResult};
use super::manifest::table_entry_name;
use crate::database::{encode_row, RowSource, TableSchema};

/// A table written to staging
#[derive(Debug, Clone)]
pub struct TableDump {
    pub schema: TableSchema,
    pub row_count: u64,
    pub sha256: String,
    pub path: PathBuf,
    pub bytes: u64,
}

impl TableDump {
    pub fn table(&self) -> &str {
        &self.schema.name
    }
}

pub struct TableDumper<'a> {
    source: &'a dyn RowSource,
}

impl<'a> TableDumper<'a> {
    pub fn new(source: &'a dyn RowSource) -> Self {
        Self { source }
    }

    /// Dump `table` into `staging_dir`. On failure nothing is left behind.
    pub fn dump(&self, table: &str, staging_dir: &Path) -> BackupResult<TableDump> {
        let schema = self
            .source
            .table_schema(table)
            .map_err(|e| BackupError::table_dump(table, e))?;
        let path = staging_dir.join(table_entry_name(table));

        match self.write_rows(&schema, &path) {
            Ok((row_count, sha256, bytes)) => Ok(TableDump {
                schema,
                row_count,
                sha256,
                path,
                bytes,
            }),
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    fn write_rows(&self, schema: &TableSchema, path: &Path) -> BackupResult<(u64, String, u64)> {
        let table = schema.name.as_str();
        let file = File::create(path).map_err(|e| BackupError::table_dump_io(table, e))?;
        let mut out = HashingWriter::new(BufWriter::new(file));

        let rows = self
            .source
            .stream_rows(table)
            .map_err(|e| BackupError::table_dump(table, e))?;

        out.write_all(b"[")
            .map_err(|e| BackupError::table_dump_io(table, e))?;

        let mut count: u64 = 0;
        for row in rows {
            let row = row.map_err(|e| BackupError::table_dump(table, e))?;
            let object = encode_row(schema, &row).map_err(|e| BackupError::table_dump(table, e))?;

            let separator: &[u8] = if count == 0 { b"\n" } else { b",\n" };
            out.write_all(separator)
                .map_err(|e| BackupError::table_dump_io(table, e))?;
            serde_json::to_writer(&mut out, &Value::Object(object))
                .map_err(|e| BackupError::table_dump_io(table, e.into()))?;
            count += 1;
        }

        out.write_all(b"\n]\n")
            .map_err(|e| BackupError::table_dump_io(table, e))?;
        out.flush()
            .map_err(|e| BackupError::table_dump_io(table, e))?;

        let (writer, digest, bytes) = out.finish();
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::table_dump_io(table, e.into_error()))?;
        file.sync_all()
            .map_err(|e| BackupError::table_dump_io(table, e))?;

        Ok((count, digest, bytes))
    }
}
