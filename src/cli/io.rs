//! JSON output for the CLI
//!
//! Every command prints exactly one JSON object on stdout:
//! `{"status":"ok","data":...}` or `{"status":"error","code":...,"message":...}`.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::{json, Value};

use super::errors::CliResult;

fn write_line(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

/// Write a success response to stdout
pub fn write_response<T: Serialize>(data: &T) -> CliResult<()> {
    write_line(&json!({
        "status": "ok",
        "data": serde_json::to_value(data)?
    }))
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_line(&json!({
        "status": "error",
        "code": code,
        "message": message
    }))
}
