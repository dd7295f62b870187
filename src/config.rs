//! Platform configuration
//!
//! Loaded from a JSON file. Every field except `database_path` has a
//! default; `":memory:"` selects a private in-memory database.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::observability::Severity;

/// In-memory database marker for `database_path`
pub const IN_MEMORY: &str = ":memory:";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_crud_timeout_ms() -> u64 {
    5_000
}

fn default_migration_timeout_ms() -> u64 {
    60_000
}

fn default_read_pool_size() -> usize {
    4
}

fn default_page_size() -> usize {
    100
}

fn default_max_page_size() -> usize {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Platform configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// SQLite database file, or `:memory:`
    pub database_path: String,

    /// How long a statement waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Deadline for one CRUD call
    #[serde(default = "default_crud_timeout_ms")]
    pub crud_timeout_ms: u64,

    /// Read-only connections serving record reads beside the writer
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,

    /// Deadline for applying one schema version
    #[serde(default = "default_migration_timeout_ms")]
    pub migration_timeout_ms: u64,

    /// Page size when a list request names none
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Hard cap on page size
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Reject unknown record fields instead of dropping them
    #[serde(default)]
    pub strict_validation: bool,

    /// Minimum log severity
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PlatformConfig {
    /// In-memory configuration with every default
    pub fn in_memory() -> Self {
        Self::with_database(IN_MEMORY)
    }

    pub fn with_database(path: impl Into<String>) -> Self {
        Self {
            database_path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            crud_timeout_ms: default_crud_timeout_ms(),
            read_pool_size: default_read_pool_size(),
            migration_timeout_ms: default_migration_timeout_ms(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            strict_validation: false,
            log_level: default_log_level(),
        }
    }

    /// Reads and validates a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: PlatformConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: display,
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.trim().is_empty() {
            return Err(ConfigError::Invalid("database_path must not be empty".into()));
        }
        if self.max_page_size == 0 {
            return Err(ConfigError::Invalid("max_page_size must be positive".into()));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(ConfigError::Invalid(format!(
                "default_page_size must be between 1 and max_page_size ({})",
                self.max_page_size
            )));
        }
        if self.crud_timeout_ms == 0 || self.migration_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if Severity::parse(&self.log_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log_level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path == IN_MEMORY
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn crud_timeout(&self) -> Duration {
        Duration::from_millis(self.crud_timeout_ms)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }

    pub fn severity(&self) -> Severity {
        Severity::parse(&self.log_level).unwrap_or(Severity::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_apply() {
        let config: PlatformConfig =
            serde_json::from_str(r#"{"database_path": "/tmp/x.db"}"#).unwrap();
        assert_eq!(config.max_page_size, 1_000);
        assert_eq!(config.default_page_size, 100);
        assert_eq!(config.crud_timeout(), Duration::from_secs(5));
        assert!(!config.strict_validation);
        assert_eq!(config.read_pool_size, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_page_sizes_rejected() {
        let mut config = PlatformConfig::in_memory();
        config.default_page_size = 5_000;
        assert!(config.validate().is_err());
        config.default_page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"database_path": ":memory:", "log_level": "warn"}}"#).unwrap();
        let config = PlatformConfig::load(file.path()).unwrap();
        assert!(config.is_in_memory());
        assert_eq!(config.severity(), Severity::Warn);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            PlatformConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
