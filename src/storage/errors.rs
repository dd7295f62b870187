//! Storage errors and their translation into the public taxonomy
//!
//! Raw engine messages stay inside this module: they are logged when
//! converted, never forwarded to collaborators.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::errors::TablesmithError;
use crate::observability::Logger;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised while talking to the relational engine
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// A unique index or primary key rejected the write
    #[error("unique constraint violated on column {column:?}")]
    UniqueViolation { column: Option<String> },

    /// Any other constraint failure
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// The engine stayed locked past the busy timeout
    #[error("database busy")]
    Busy,

    /// The operation observed its cancel flag and rolled back
    #[error("operation cancelled")]
    Cancelled,

    /// A metadata row could not be decoded
    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    /// The connection mutex was poisoned by a panicking writer
    #[error("connection lock poisoned")]
    Poisoned,

    /// Unclassified engine error
    #[error("sqlite: {0}")]
    Sqlite(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                let unique = failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY;
                if unique {
                    StorageError::UniqueViolation {
                        column: message.as_deref().and_then(violated_column),
                    }
                } else {
                    StorageError::Constraint(err.to_string())
                }
            }
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                StorageError::Busy
            }
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::OperationInterrupted =>
            {
                StorageError::Cancelled
            }
            _ => StorageError::Sqlite(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

/// Extracts the column from "UNIQUE constraint failed: table.column"
fn violated_column(message: &str) -> Option<String> {
    let target = message.rsplit(": ").next()?;
    let first = target.split(',').next()?.trim();
    first.rsplit('.').next().map(str::to_string)
}

impl From<StorageError> for TablesmithError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => TablesmithError::timeout("storage operation"),
            StorageError::Busy => {
                Logger::warn("STORAGE_BUSY", &[]);
                TablesmithError::timeout("storage operation")
            }
            StorageError::UniqueViolation { .. } => {
                TablesmithError::conflict("a uniqueness constraint rejected the write")
            }
            other => {
                let detail = other.to_string();
                Logger::error("STORAGE_FAILURE", &[("detail", detail.as_str())]);
                TablesmithError::internal("storage failure")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_violated_column_parsing() {
        assert_eq!(
            violated_column("UNIQUE constraint failed: t_x.c_email_ab12"),
            Some("c_email_ab12".to_string())
        );
        assert_eq!(
            violated_column("UNIQUE constraint failed: t.a, t.b"),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_raw_errors_are_sanitized() {
        let err: TablesmithError = StorageError::Sqlite("no such table: t_secret".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.message().contains("t_secret"));
    }

    #[test]
    fn test_cancellation_maps_to_timeout() {
        let err: TablesmithError = StorageError::Cancelled.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_unique_failure_from_engine() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (c TEXT); CREATE UNIQUE INDEX ux ON t(c);")
            .unwrap();
        conn.execute("INSERT INTO t (c) VALUES ('a')", []).unwrap();
        let raw = conn.execute("INSERT INTO t (c) VALUES ('a')", []).unwrap_err();
        match StorageError::from(raw) {
            StorageError::UniqueViolation { column } => assert_eq!(column.as_deref(), Some("c")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
