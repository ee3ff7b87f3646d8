//! Database interface errors

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DatabaseError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Unknown column '{column}' on table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Row in {table} has no value for primary key '{column}'")]
    MissingPrimaryKey { table: String, column: String },

    #[error("Duplicate primary key {key} in {table}")]
    DuplicateKey { table: String, key: String },

    /// A row points at a parent row that does not exist
    #[error(
        "Foreign key violation: {table} row {row_key} has {column}={value} but no such row exists in {referenced_table}"
    )]
    ForeignKeyViolation {
        table: String,
        row_key: String,
        column: String,
        value: String,
        referenced_table: String,
    },

    /// A delete would orphan child rows
    #[error(
        "Foreign key violation: {table} row {row_key} is still referenced by {child_table}.{column}"
    )]
    StillReferenced {
        table: String,
        row_key: String,
        child_table: String,
        column: String,
    },

    #[error("Cannot decode {table}.{column}: {reason}")]
    Decode {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Cannot encode {table}.{column}: {reason}")]
    Encode {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DatabaseError {
    /// Whether the failure is a referential-integrity violation
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(
            self,
            DatabaseError::ForeignKeyViolation { .. } | DatabaseError::StillReferenced { .. }
        )
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
