//! In-memory database with primary-key and foreign-key enforcement
//!
//! Used by the CLI (persisted to a JSON file between invocations) and by
//! tests as the fake behind `RowSource`/`RowSink`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::codec::{decode_row, encode_row};
use super::errors::{DatabaseError, DatabaseResult};
use super::{Row, RowSink, RowSource, RowStream, SqlValue, TableSchema};
use crate::fs_util;

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: Vec<Row>,
}

impl MemTable {
    fn position_of(&self, key: &SqlValue) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.get(&self.schema.primary_key) == Some(key))
    }

    fn has_value(&self, column: &str, value: &SqlValue) -> bool {
        self.rows.iter().any(|r| r.get(column) == Some(value))
    }
}

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: RwLock<BTreeMap<String, MemTable>>,
}

/// On-disk form: schema plus encoded rows per table
#[derive(Debug, Serialize, Deserialize)]
struct PersistedTable {
    schema: TableSchema,
    rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedDatabase {
    tables: Vec<PersistedTable>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> DatabaseResult<RwLockReadGuard<'_, BTreeMap<String, MemTable>>> {
        self.tables
            .read()
            .map_err(|_| DatabaseError::Storage("Lock poisoned".to_string()))
    }

    fn write(&self) -> DatabaseResult<RwLockWriteGuard<'_, BTreeMap<String, MemTable>>> {
        self.tables
            .write()
            .map_err(|_| DatabaseError::Storage("Lock poisoned".to_string()))
    }

    pub fn create_table(&self, schema: TableSchema) -> DatabaseResult<()> {
        let mut tables = self.write()?;
        if tables.contains_key(&schema.name) {
            return Err(DatabaseError::TableExists(schema.name));
        }
        tables.insert(
            schema.name.clone(),
            MemTable {
                schema,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> DatabaseResult<()> {
        self.write()?
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))
    }

    /// Insert a single row
    pub fn insert(&self, table: &str, row: Row) -> DatabaseResult<()> {
        self.insert_rows(table, vec![row]).map(|_| ())
    }

    /// Copy of every row in insertion order
    pub fn rows(&self, table: &str) -> DatabaseResult<Vec<Row>> {
        let tables = self.read()?;
        tables
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))
    }

    /// Load a database previously written by `save_to_file`.
    ///
    /// Rows are loaded as stored, without re-checking constraints.
    pub fn load_from_file(path: &Path) -> DatabaseResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| DatabaseError::Storage(format!("{}: {}", path.display(), e)))?;
        let persisted: PersistedDatabase = serde_json::from_str(&content)
            .map_err(|e| DatabaseError::Storage(format!("{}: {}", path.display(), e)))?;

        let mut tables = BTreeMap::new();
        for table in persisted.tables {
            let rows = table
                .rows
                .into_iter()
                .map(|object| decode_row(&table.schema, object))
                .collect::<DatabaseResult<Vec<_>>>()?;
            tables.insert(
                table.schema.name.clone(),
                MemTable {
                    schema: table.schema,
                    rows,
                },
            );
        }

        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    /// Persist every table atomically
    pub fn save_to_file(&self, path: &Path) -> DatabaseResult<()> {
        let persisted = {
            let tables = self.read()?;
            let mut out = Vec::with_capacity(tables.len());
            for table in tables.values() {
                let rows = table
                    .rows
                    .iter()
                    .map(|r| encode_row(&table.schema, r))
                    .collect::<DatabaseResult<Vec<_>>>()?;
                out.push(PersistedTable {
                    schema: table.schema.clone(),
                    rows,
                });
            }
            PersistedDatabase { tables: out }
        };

        let json = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| DatabaseError::Storage(e.to_string()))?;
        fs_util::atomic_write(path, &json)
            .map_err(|e| DatabaseError::Storage(format!("{}: {}", path.display(), e)))
    }

    /// Validate a batch against the current state. `replace_existing`
    /// permits keys that already exist (upsert).
    fn check_batch(
        tables: &BTreeMap<String, MemTable>,
        target: &MemTable,
        rows: &[Row],
        replace_existing: bool,
    ) -> DatabaseResult<()> {
        let schema = &target.schema;
        let mut batch_keys: HashSet<String> = HashSet::new();

        for row in rows {
            if let Some(unknown) = row.keys().find(|k| schema.column_spec(k).is_none()) {
                return Err(DatabaseError::UnknownColumn {
                    table: schema.name.clone(),
                    column: unknown.clone(),
                });
            }

            let key = match row.get(&schema.primary_key) {
                Some(v) if !v.is_null() => v,
                _ => {
                    return Err(DatabaseError::MissingPrimaryKey {
                        table: schema.name.clone(),
                        column: schema.primary_key.clone(),
                    })
                }
            };
            let key_text = key.to_string();
            if !batch_keys.insert(key_text.clone())
                || (!replace_existing && target.position_of(key).is_some())
            {
                return Err(DatabaseError::DuplicateKey {
                    table: schema.name.clone(),
                    key: key_text,
                });
            }
        }

        for row in rows {
            for fk in &schema.foreign_keys {
                let value = match row.get(&fk.column) {
                    Some(v) if !v.is_null() => v,
                    _ => continue,
                };

                let in_table = tables
                    .get(&fk.references_table)
                    .map(|t| t.has_value(&fk.references_column, value))
                    .unwrap_or(false);
                let in_batch = fk.references_table == schema.name
                    && rows
                        .iter()
                        .any(|r| r.get(&fk.references_column) == Some(value));

                if !in_table && !in_batch {
                    return Err(DatabaseError::ForeignKeyViolation {
                        table: schema.name.clone(),
                        row_key: schema.row_key(row),
                        column: fk.column.clone(),
                        value: value.to_string(),
                        referenced_table: fk.references_table.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl RowSource for MemoryDatabase {
    fn list_tables(&self) -> DatabaseResult<Vec<String>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    fn table_schema(&self, table: &str) -> DatabaseResult<TableSchema> {
        self.read()?
            .get(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))
    }

    fn stream_rows(&self, table: &str) -> DatabaseResult<RowStream<'_>> {
        // Snapshot so the lock is not held while the caller consumes rows
        let rows = self.rows(table)?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn count_rows(&self, table: &str) -> DatabaseResult<u64> {
        self.read()?
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))
    }
}

impl RowSink for MemoryDatabase {
    fn delete_all(&self, table: &str) -> DatabaseResult<u64> {
        let mut tables = self.write()?;
        let target = tables
            .get(table)
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))?;

        for child in tables.values().filter(|t| t.schema.name != table) {
            for fk in child
                .schema
                .foreign_keys
                .iter()
                .filter(|fk| fk.references_table == table)
            {
                for child_row in &child.rows {
                    let value = match child_row.get(&fk.column) {
                        Some(v) if !v.is_null() => v,
                        _ => continue,
                    };
                    if let Some(parent) = target
                        .rows
                        .iter()
                        .find(|r| r.get(&fk.references_column) == Some(value))
                    {
                        return Err(DatabaseError::StillReferenced {
                            table: table.to_string(),
                            row_key: target.schema.row_key(parent),
                            child_table: child.schema.name.clone(),
                            column: fk.column.clone(),
                        });
                    }
                }
            }
        }

        let target = tables
            .get_mut(table)
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))?;
        let removed = target.rows.len() as u64;
        target.rows.clear();
        Ok(removed)
    }

    fn insert_rows(&self, table: &str, rows: Vec<Row>) -> DatabaseResult<u64> {
        let mut tables = self.write()?;
        {
            let target = tables
                .get(table)
                .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))?;
            Self::check_batch(&tables, target, &rows, false)?;
        }

        let target = tables
            .get_mut(table)
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))?;
        let count = rows.len() as u64;
        target.rows.extend(rows);
        Ok(count)
    }

    fn upsert_rows(&self, table: &str, rows: Vec<Row>) -> DatabaseResult<u64> {
        let mut tables = self.write()?;
        {
            let target = tables
                .get(table)
                .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))?;
            Self::check_batch(&tables, target, &rows, true)?;
        }

        let target = tables
            .get_mut(table)
            .ok_or_else(|| DatabaseError::TableNotFound(table.to_string()))?;
        let count = rows.len() as u64;
        for row in rows {
            let existing = row
                .get(&target.schema.primary_key)
                .and_then(|key| target.position_of(key));
            match existing {
                Some(idx) => target.rows[idx] = row,
                None => target.rows.push(row),
            }
        }
        Ok(count)
    }
}
