//! CLI-specific error types

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::errors::TablesmithError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (files, stdin/stdout)
    IoError,
    /// Malformed command input
    InvalidInput,
    /// Runtime or database could not be started
    BootFailed,
    /// The platform rejected the operation
    Operation(&'static str),
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "TS_CLI_CONFIG_ERROR",
            Self::IoError => "TS_CLI_IO_ERROR",
            Self::InvalidInput => "TS_CLI_INVALID_INPUT",
            Self::BootFailed => "TS_CLI_BOOT_FAILED",
            Self::Operation(code) => code,
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidInput, msg)
    }

    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_input(format!("JSON error: {}", e))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<TablesmithError> for CliError {
    fn from(e: TablesmithError) -> Self {
        let message = match e.field_errors() {
            [] => e.message().to_string(),
            errors => {
                let detail: Vec<String> = errors
                    .iter()
                    .map(|fe| format!("{} ({})", fe.field, fe.reason.as_str()))
                    .collect();
                format!("{}: {}", e.message(), detail.join(", "))
            }
        };
        Self::new(CliErrorCode::Operation(e.kind().code()), message)
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FieldError;

    #[test]
    fn test_platform_errors_keep_their_code() {
        let err = CliError::from(TablesmithError::validation(vec![FieldError::required("name")]));
        assert_eq!(err.code_str(), "TS_VALIDATION_ERROR");
        assert!(err.message().contains("name (required)"));
    }
}
