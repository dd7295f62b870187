//! JSON I/O handling for CLI
//!
//! - Input: one JSON document from a file, or stdin when the path is `-`
//! - Output: one JSON object per line on stdout
//! - UTF-8 only

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::errors::{CliError, CliResult};

/// Read a JSON document from `path`, or stdin for `-`
pub fn read_document<T: DeserializeOwned>(path: &Path) -> CliResult<T> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().lock().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(path)
            .map_err(|e| CliError::io_error(format!("cannot read {}: {}", path.display(), e)))?
    };

    if raw.trim().is_empty() {
        return Err(CliError::invalid_input("Empty input"));
    }
    Ok(serde_json::from_str(&raw)?)
}

/// Write a success response to stdout
pub fn write_response<T: Serialize>(data: &T) -> CliResult<()> {
    let response = serde_json::json!({
        "status": "ok",
        "data": serde_json::to_value(data)?
    });
    write_line(&response)
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    let response = serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    });
    write_line(&response)
}

fn write_line(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_document_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"op": "remove", "name": "notes"}}]"#).unwrap();
        let value: Value = read_document(file.path()).unwrap();
        assert_eq!(value[0]["op"], "remove");
    }

    #[test]
    fn test_empty_document_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = read_document::<Value>(file.path()).unwrap_err();
        assert_eq!(err.code_str(), "TS_CLI_INVALID_INPUT");
    }
}
