//! Logical field types and their physical storage classes
//!
//! Supported logical types:
//! - short_text: bounded UTF-8 string (default 255 characters)
//! - long_text: UTF-8 string, optionally bounded
//! - integer: 64-bit signed integer with optional bounds
//! - decimal: finite 64-bit float with optional bounds
//! - boolean
//! - date: calendar date, `YYYY-MM-DD`
//! - datetime: instant, RFC 3339 in UTC
//! - email
//! - choice: one of a declared list of options
//! - json: structured blob (object or array)

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default character limit for `short_text`
pub const DEFAULT_SHORT_TEXT_LENGTH: u32 = 255;

/// Upper bound accepted for any declared text limit
pub const MAX_TEXT_LENGTH: u32 = 65_535;

/// Longest email address accepted (RFC 5321 path limit)
pub const MAX_EMAIL_LENGTH: u32 = 254;

fn default_short_text_length() -> u32 {
    DEFAULT_SHORT_TEXT_LENGTH
}

/// User-facing field kind with its type-specific constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogicalType {
    ShortText {
        #[serde(default = "default_short_text_length")]
        max_length: u32,
    },
    LongText {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<u32>,
    },
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Decimal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Boolean,
    Date,
    Datetime,
    Email,
    Choice {
        options: Vec<String>,
    },
    Json,
}

impl LogicalType {
    pub fn short_text() -> Self {
        LogicalType::ShortText {
            max_length: DEFAULT_SHORT_TEXT_LENGTH,
        }
    }

    pub fn long_text() -> Self {
        LogicalType::LongText { max_length: None }
    }

    pub fn integer() -> Self {
        LogicalType::Integer {
            min: None,
            max: None,
        }
    }

    pub fn decimal() -> Self {
        LogicalType::Decimal {
            min: None,
            max: None,
        }
    }

    pub fn choice<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LogicalType::Choice {
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the type name used in metadata and error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            LogicalType::ShortText { .. } => "short_text",
            LogicalType::LongText { .. } => "long_text",
            LogicalType::Integer { .. } => "integer",
            LogicalType::Decimal { .. } => "decimal",
            LogicalType::Boolean => "boolean",
            LogicalType::Date => "date",
            LogicalType::Datetime => "datetime",
            LogicalType::Email => "email",
            LogicalType::Choice { .. } => "choice",
            LogicalType::Json => "json",
        }
    }

    /// Physical column type. A pure function of the logical type.
    pub fn physical_type(&self) -> PhysicalType {
        match self {
            LogicalType::Integer { .. } | LogicalType::Boolean => PhysicalType::Integer,
            LogicalType::Decimal { .. } => PhysicalType::Real,
            _ => PhysicalType::Text,
        }
    }

    /// Checks the constraints carried by the variant itself
    pub fn check_constraints(&self) -> Result<(), String> {
        match self {
            LogicalType::ShortText { max_length } => {
                if *max_length == 0 || *max_length > MAX_TEXT_LENGTH {
                    return Err(format!(
                        "short_text max_length must be between 1 and {}",
                        MAX_TEXT_LENGTH
                    ));
                }
            }
            LogicalType::LongText {
                max_length: Some(max_length),
            } => {
                if *max_length == 0 {
                    return Err("long_text max_length must be positive".into());
                }
            }
            LogicalType::Integer {
                min: Some(min),
                max: Some(max),
            } if min > max => {
                return Err(format!("integer min {} exceeds max {}", min, max));
            }
            LogicalType::Decimal { min, max } => {
                for bound in [min, max].into_iter().flatten() {
                    if !bound.is_finite() {
                        return Err("decimal bounds must be finite".into());
                    }
                }
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(format!("decimal min {} exceeds max {}", min, max));
                    }
                }
            }
            LogicalType::Choice { options } => {
                if options.is_empty() {
                    return Err("choice needs at least one option".into());
                }
                let mut seen = std::collections::HashSet::new();
                for option in options {
                    if option.is_empty() {
                        return Err("choice options must not be empty".into());
                    }
                    if !seen.insert(option.as_str()) {
                        return Err(format!("duplicate choice option '{}'", option));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Storage class of a physical column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PhysicalType {
    Text,
    Integer,
    Real,
}

impl PhysicalType {
    /// Column type keyword used in DDL
    pub fn sql_name(&self) -> &'static str {
        match self {
            PhysicalType::Text => "TEXT",
            PhysicalType::Integer => "INTEGER",
            PhysicalType::Real => "REAL",
        }
    }
}

impl fmt::Display for PhysicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_name())
    }
}

/// A validated value in its storage representation
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logical_type_json_shape() {
        let ty: LogicalType = serde_json::from_value(json!({"type": "short_text"})).unwrap();
        assert_eq!(ty, LogicalType::short_text());

        let ty: LogicalType =
            serde_json::from_value(json!({"type": "choice", "options": ["a", "b"]})).unwrap();
        assert_eq!(ty, LogicalType::choice(["a", "b"]));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<LogicalType, _> = serde_json::from_value(json!({"type": "money"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_physical_type_is_pure_function_of_logical_type() {
        assert_eq!(LogicalType::Boolean.physical_type(), PhysicalType::Integer);
        assert_eq!(LogicalType::decimal().physical_type(), PhysicalType::Real);
        assert_eq!(LogicalType::Email.physical_type(), PhysicalType::Text);
        assert_eq!(LogicalType::Json.physical_type(), PhysicalType::Text);
    }

    #[test]
    fn test_constraint_checks() {
        assert!(LogicalType::ShortText { max_length: 0 }.check_constraints().is_err());
        assert!(LogicalType::choice(Vec::<String>::new()).check_constraints().is_err());
        assert!(LogicalType::choice(["a", "a"]).check_constraints().is_err());
        assert!(LogicalType::Integer {
            min: Some(5),
            max: Some(1)
        }
        .check_constraints()
        .is_err());
        assert!(LogicalType::short_text().check_constraints().is_ok());
    }
}
