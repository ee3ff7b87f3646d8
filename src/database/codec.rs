//! Row encoding for table dumps
//!
//! Rows are written as JSON objects with keys in declared column order.
//! Timestamps become RFC 3339 strings, binary becomes base64, JSON columns
//! are embedded as-is. Decoding is driven by the declared column kinds.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};

use super::errors::{DatabaseError, DatabaseResult};
use super::{ColumnKind, Row, SqlValue, TableSchema};

/// Encode a row in column order. Columns missing from the row encode as null.
pub fn encode_row(schema: &TableSchema, row: &Row) -> DatabaseResult<Map<String, Value>> {
    if let Some(unknown) = row.keys().find(|k| schema.column_spec(k).is_none()) {
        return Err(DatabaseError::UnknownColumn {
            table: schema.name.clone(),
            column: unknown.clone(),
        });
    }

    let mut out = Map::with_capacity(schema.columns.len());
    for column in &schema.columns {
        let value = match row.get(&column.name) {
            None | Some(SqlValue::Null) => Value::Null,
            Some(SqlValue::Bool(b)) => Value::Bool(*b),
            Some(SqlValue::Integer(i)) => Value::Number((*i).into()),
            Some(SqlValue::Float(x)) => {
                Number::from_f64(*x)
                    .map(Value::Number)
                    .ok_or_else(|| DatabaseError::Encode {
                        table: schema.name.clone(),
                        column: column.name.clone(),
                        reason: format!("{} is not a finite number", x),
                    })?
            }
            Some(SqlValue::Text(s)) => Value::String(s.clone()),
            Some(SqlValue::Timestamp(ts)) => {
                Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Some(SqlValue::Binary(bytes)) => Value::String(STANDARD.encode(bytes)),
            Some(SqlValue::Json(v)) => v.clone(),
        };
        out.insert(column.name.clone(), value);
    }
    Ok(out)
}

/// Decode a dumped object back into a row using the declared kinds
pub fn decode_row(schema: &TableSchema, object: Map<String, Value>) -> DatabaseResult<Row> {
    let mut row = Row::new();
    for (name, value) in object {
        let spec = schema
            .column_spec(&name)
            .ok_or_else(|| DatabaseError::UnknownColumn {
                table: schema.name.clone(),
                column: name.clone(),
            })?;
        let decoded = decode_value(spec.kind, value).map_err(|reason| DatabaseError::Decode {
            table: schema.name.clone(),
            column: name.clone(),
            reason,
        })?;
        row.insert(name, decoded);
    }
    Ok(row)
}

fn decode_value(kind: ColumnKind, value: Value) -> Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    match kind {
        ColumnKind::Json => Ok(SqlValue::Json(value)),
        ColumnKind::Text => match value {
            Value::String(s) => Ok(SqlValue::Text(s)),
            other => Err(format!("expected string, found {}", other)),
        },
        ColumnKind::Integer => value
            .as_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| format!("expected integer, found {}", value)),
        ColumnKind::Float => value
            .as_f64()
            .map(SqlValue::Float)
            .ok_or_else(|| format!("expected number, found {}", value)),
        ColumnKind::Boolean => value
            .as_bool()
            .map(SqlValue::Bool)
            .ok_or_else(|| format!("expected boolean, found {}", value)),
        ColumnKind::Timestamp => {
            let s = value
                .as_str()
                .ok_or_else(|| format!("expected timestamp string, found {}", value))?;
            DateTime::parse_from_rfc3339(s)
                .map(|ts| SqlValue::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
        }
        ColumnKind::Binary => {
            let s = value
                .as_str()
                .ok_or_else(|| format!("expected base64 string, found {}", value))?;
            STANDARD
                .decode(s)
                .map(SqlValue::Binary)
                .map_err(|e| format!("invalid base64: {}", e))
        }
    }
}
