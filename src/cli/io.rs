//! JSON output for CLI commands
//!
//! One JSON object per line on stdout; logs go to stderr.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;

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
    write_line(&serde_json::json!({
        "status": "ok",
        "data": data,
    }))
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str, data: Option<&Value>) -> CliResult<()> {
    let mut response = serde_json::json!({
        "status": "error",
        "code": code,
        "message": message,
    });
    if let (Some(data), Value::Object(map)) = (data, &mut response) {
        map.insert("data".to_string(), data.clone());
    }
    write_line(&response)
}
