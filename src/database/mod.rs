//! Database interface consumed by the backup pipeline
//!
//! The pipeline never talks to a driver directly. Backups read through
//! [`RowSource`]; restores write through [`RowSink`]. [`MemoryDatabase`]
//! implements both with primary-key and foreign-key enforcement and backs
//! the CLI and the test suite.

mod codec;
mod errors;
mod memory;

pub use codec::{decode_row, encode_row};
pub use errors::{DatabaseError, DatabaseResult};
pub use memory::MemoryDatabase;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical column type, used to encode and decode dump values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    Boolean,
    /// Stored as an ISO-8601 string in dumps
    Timestamp,
    /// Stored as base64 in dumps
    Binary,
    /// Embedded structurally in dumps
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Declared shape of a table. Embedded in every archive manifest so a
/// restore can decode rows without consulting the live schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: String,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Schema with a primary-key column of the given kind
    pub fn new(name: &str, primary_key: &str, key_kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            columns: vec![ColumnSpec {
                name: primary_key.to_string(),
                kind: key_kind,
                nullable: false,
            }],
            primary_key: primary_key.to_string(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, kind: ColumnKind) -> Self {
        self.columns.push(ColumnSpec {
            name: name.to_string(),
            kind,
            nullable: false,
        });
        self
    }

    pub fn nullable_column(mut self, name: &str, kind: ColumnKind) -> Self {
        self.columns.push(ColumnSpec {
            name: name.to_string(),
            kind,
            nullable: true,
        });
        self
    }

    /// Declare `column` as referencing `table.references_column`
    pub fn foreign_key(mut self, column: &str, table: &str, references_column: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            references_table: table.to_string(),
            references_column: references_column.to_string(),
        });
        self
    }

    pub fn column_spec(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Tables this one references, excluding itself
    pub fn parent_tables(&self) -> impl Iterator<Item = &str> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.references_table.as_str())
            .filter(move |t| *t != self.name)
    }

    /// Printable primary key of a row, `?` when absent
    pub fn row_key(&self, row: &Row) -> String {
        row.get(&self.primary_key)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string())
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::Integer(i) => write!(f, "{}", i),
            SqlValue::Float(x) => write!(f, "{}", x),
            SqlValue::Text(s) => write!(f, "{}", s),
            SqlValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            SqlValue::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            SqlValue::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        SqlValue::Integer(i)
    }
}

impl From<i32> for SqlValue {
    fn from(i: i32) -> Self {
        SqlValue::Integer(i64::from(i))
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Bool(b)
    }
}

impl From<f64> for SqlValue {
    fn from(x: f64) -> Self {
        SqlValue::Float(x)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(ts: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(ts)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One row, column name to value
pub type Row = BTreeMap<String, SqlValue>;

/// Lazy, finite sequence of rows
pub type RowStream<'a> = Box<dyn Iterator<Item = DatabaseResult<Row>> + Send + 'a>;

/// Build a row from `(column, value)` pairs
pub fn row<I, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<SqlValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into()))
        .collect()
}

/// Read side used by backups
pub trait RowSource: Send + Sync {
    /// Tables that exist in the live database
    fn list_tables(&self) -> DatabaseResult<Vec<String>>;

    fn table_schema(&self, table: &str) -> DatabaseResult<TableSchema>;

    /// Stream every row of `table`. Implementations must not buffer the
    /// whole table.
    fn stream_rows(&self, table: &str) -> DatabaseResult<RowStream<'_>>;

    fn count_rows(&self, table: &str) -> DatabaseResult<u64>;
}

/// Write side used by restores. Each call applies to one table and is
/// all-or-nothing.
pub trait RowSink: Send + Sync {
    /// Delete every row, returning how many were removed
    fn delete_all(&self, table: &str) -> DatabaseResult<u64>;

    /// Insert rows; any duplicate key or foreign-key failure rejects the batch
    fn insert_rows(&self, table: &str, rows: Vec<Row>) -> DatabaseResult<u64>;

    /// Insert or replace rows by primary key
    fn upsert_rows(&self, table: &str, rows: Vec<Row>) -> DatabaseResult<u64>;
}

/// A handle that can both be backed up and restored into
pub trait Database: RowSource + RowSink {
    fn as_source(&self) -> &dyn RowSource;

    fn as_sink(&self) -> &dyn RowSink;
}

impl<T: RowSource + RowSink> Database for T {
    fn as_source(&self) -> &dyn RowSource {
        self
    }

    fn as_sink(&self) -> &dyn RowSink {
        self
    }
}
