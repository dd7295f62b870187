//! Error taxonomy shared by every tablesmith subsystem
//!
//! Error codes:
//! - TS_VALIDATION_ERROR (field-level, recoverable)
//! - TS_CONFLICT (naming/uniqueness collision)
//! - TS_NOT_FOUND
//! - TS_UNKNOWN_FIELD
//! - TS_SCHEMA_NOT_READY (mid-migration, retryable)
//! - TS_DESTRUCTIVE_CHANGE_REJECTED
//! - TS_TENANT_ISOLATION_VIOLATION (hard deny)
//! - TS_PERMISSION_DENIED
//! - TS_MIGRATION_FAILED (table frozen at last good version)
//! - TS_TIMEOUT (retryable)
//! - TS_INTERNAL
//!
//! Raw storage-engine errors never cross this boundary. They are logged and
//! replaced by an `Internal` error with a sanitized message.

use std::fmt;

use serde::Serialize;

/// Error kinds visible to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Record or definition failed field-level validation
    ValidationError,
    /// Naming or uniqueness collision
    Conflict,
    /// Project, table or record does not exist
    NotFound,
    /// Filter or sort references an undeclared field
    UnknownField,
    /// Table has a migration in flight
    SchemaNotReady,
    /// Narrowing change or field removal without confirmation
    DestructiveChangeRejected,
    /// Caller touched a project outside its accessible set
    TenantIsolationViolation,
    /// Caller's role does not allow the operation
    PermissionDenied,
    /// Migration rolled back; table frozen at last applied version
    MigrationFailed,
    /// Operation exceeded its deadline and was cancelled
    Timeout,
    /// Storage failure that could not be classified
    Internal,
}

impl ErrorKind {
    /// Returns the stable string code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "TS_VALIDATION_ERROR",
            ErrorKind::Conflict => "TS_CONFLICT",
            ErrorKind::NotFound => "TS_NOT_FOUND",
            ErrorKind::UnknownField => "TS_UNKNOWN_FIELD",
            ErrorKind::SchemaNotReady => "TS_SCHEMA_NOT_READY",
            ErrorKind::DestructiveChangeRejected => "TS_DESTRUCTIVE_CHANGE_REJECTED",
            ErrorKind::TenantIsolationViolation => "TS_TENANT_ISOLATION_VIOLATION",
            ErrorKind::PermissionDenied => "TS_PERMISSION_DENIED",
            ErrorKind::MigrationFailed => "TS_MIGRATION_FAILED",
            ErrorKind::Timeout => "TS_TIMEOUT",
            ErrorKind::Internal => "TS_INTERNAL",
        }
    }

    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::SchemaNotReady | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Machine-readable reason attached to a field error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Required,
    NullNotAllowed,
    TypeMismatch,
    TooLong,
    OutOfRange,
    InvalidFormat,
    NotInChoices,
    NotUnique,
    UnknownField,
    InvalidDefault,
    InvalidName,
    ReservedName,
    DuplicateName,
    IncompatibleTypeChange,
    PageSizeExceeded,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Required => "required",
            ReasonCode::NullNotAllowed => "null_not_allowed",
            ReasonCode::TypeMismatch => "type_mismatch",
            ReasonCode::TooLong => "too_long",
            ReasonCode::OutOfRange => "out_of_range",
            ReasonCode::InvalidFormat => "invalid_format",
            ReasonCode::NotInChoices => "not_in_choices",
            ReasonCode::NotUnique => "not_unique",
            ReasonCode::UnknownField => "unknown_field",
            ReasonCode::InvalidDefault => "invalid_default",
            ReasonCode::InvalidName => "invalid_name",
            ReasonCode::ReservedName => "reserved_name",
            ReasonCode::DuplicateName => "duplicate_name",
            ReasonCode::IncompatibleTypeChange => "incompatible_type_change",
            ReasonCode::PageSizeExceeded => "page_size_exceeded",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One field-level failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: ReasonCode,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason,
            message: message.into(),
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("field '{}' is required", field);
        Self::new(field, ReasonCode::Required, message)
    }

    pub fn type_mismatch(field: impl Into<String>, expected: &str, actual: &str) -> Self {
        let field = field.into();
        let message = format!("field '{}': expected {}, got {}", field, expected, actual);
        Self::new(field, ReasonCode::TypeMismatch, message)
    }

    pub fn not_unique(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("value of field '{}' is already used by another record", field);
        Self::new(field, ReasonCode::NotUnique, message)
    }

    pub fn unknown_field(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("field '{}' is not declared on this table", field);
        Self::new(field, ReasonCode::UnknownField, message)
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.reason)
    }
}

/// Error returned by every public tablesmith operation
#[derive(Debug, Clone, Serialize)]
pub struct TablesmithError {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    field_errors: Vec<FieldError>,
}

impl TablesmithError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            table: None,
            field_errors: Vec::new(),
        }
    }

    /// Validation failure carrying every collected field error
    pub fn validation(field_errors: Vec<FieldError>) -> Self {
        let message = match field_errors.as_slice() {
            [single] => single.message.clone(),
            errors => format!("{} fields failed validation", errors.len()),
        };
        Self {
            kind: ErrorKind::ValidationError,
            message,
            table: None,
            field_errors,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Uniqueness collision on a record field
    pub fn unique_violation(field: impl Into<String>) -> Self {
        let error = FieldError::not_unique(field);
        Self {
            kind: ErrorKind::Conflict,
            message: error.message.clone(),
            table: None,
            field_errors: vec![error],
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unknown_field(field: impl Into<String>) -> Self {
        let error = FieldError::unknown_field(field);
        Self {
            kind: ErrorKind::UnknownField,
            message: error.message.clone(),
            table: None,
            field_errors: vec![error],
        }
    }

    pub fn schema_not_ready(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            kind: ErrorKind::SchemaNotReady,
            message: format!("table '{}' is migrating; retry later", table),
            table: Some(table),
            field_errors: Vec::new(),
        }
    }

    pub fn destructive_change(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DestructiveChangeRejected, message)
    }

    pub fn isolation_violation(project_id: &str) -> Self {
        Self::new(
            ErrorKind::TenantIsolationViolation,
            format!("project '{}' is not accessible to this caller", project_id),
        )
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MigrationFailed, message)
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{} exceeded its deadline and was cancelled", operation),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach the logical table name
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_field_errors(mut self, field_errors: Vec<FieldError>) -> Self {
        self.field_errors = field_errors;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn field_errors(&self) -> &[FieldError] {
        &self.field_errors
    }

    /// First field error for `field`, if any
    pub fn field_error(&self, field: &str) -> Option<&FieldError> {
        self.field_errors.iter().find(|e| e.field == field)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for TablesmithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)?;
        if let Some(table) = &self.table {
            write!(f, " [table {}]", table)?;
        }
        Ok(())
    }
}

impl std::error::Error for TablesmithError {}

/// Result type for tablesmith operations
pub type TablesmithResult<T> = Result<T, TablesmithError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ErrorKind::ValidationError.code(), "TS_VALIDATION_ERROR");
        assert_eq!(ErrorKind::Conflict.code(), "TS_CONFLICT");
        assert_eq!(ErrorKind::SchemaNotReady.code(), "TS_SCHEMA_NOT_READY");
        assert_eq!(
            ErrorKind::DestructiveChangeRejected.code(),
            "TS_DESTRUCTIVE_CHANGE_REJECTED"
        );
    }

    #[test]
    fn test_only_transient_kinds_are_retryable() {
        assert!(ErrorKind::SchemaNotReady.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::MigrationFailed.is_retryable());
    }

    #[test]
    fn test_unique_violation_carries_field_detail() {
        let err = TablesmithError::unique_violation("email");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let detail = err.field_error("email").unwrap();
        assert_eq!(detail.reason, ReasonCode::NotUnique);
    }

    #[test]
    fn test_validation_message_summarizes_multiple_errors() {
        let err = TablesmithError::validation(vec![
            FieldError::required("name"),
            FieldError::required("email"),
        ]);
        assert_eq!(err.message(), "2 fields failed validation");
        assert_eq!(err.field_errors().len(), 2);
    }

    #[test]
    fn test_display_includes_code_and_table() {
        let err = TablesmithError::schema_not_ready("clients");
        let display = format!("{}", err);
        assert!(display.contains("TS_SCHEMA_NOT_READY"));
        assert!(display.contains("clients"));
    }
}
