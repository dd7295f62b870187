//! Field Type Registry
//!
//! Maps the closed set of logical types to their physical storage type, a
//! validator (raw wire value to storage value) and a serializer (storage
//! value back to wire value).
//!
//! # Design Principles
//!
//! - Closed world: adding a type means adding a `LogicalType` variant
//! - No implicit coercion: a string is never accepted as a number
//! - Structured errors (field, reason code, message), never panics
//! - For every accepted value, serialize then validate yields the same value

mod change;
mod types;

pub use change::{classify, ChangeKind, TypeChange, ValueTransform};
pub use types::{
    CellValue, LogicalType, PhysicalType, DEFAULT_SHORT_TEXT_LENGTH, MAX_EMAIL_LENGTH,
    MAX_TEXT_LENGTH,
};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Number, Value};

use crate::errors::{FieldError, ReasonCode};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Registry of logical type handlers
#[derive(Debug, Clone)]
pub struct FieldTypeRegistry {
    email: Regex,
}

impl Default for FieldTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldTypeRegistry {
    pub fn new() -> Self {
        Self {
            email: Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email pattern"),
        }
    }

    /// Resolves the handler for a logical type
    pub fn resolve<'a>(&'a self, logical_type: &'a LogicalType) -> TypeHandler<'a> {
        TypeHandler {
            registry: self,
            logical_type,
        }
    }
}

/// Validator and serializer bound to one logical type
#[derive(Debug, Clone, Copy)]
pub struct TypeHandler<'a> {
    registry: &'a FieldTypeRegistry,
    logical_type: &'a LogicalType,
}

impl<'a> TypeHandler<'a> {
    pub fn physical_type(&self) -> PhysicalType {
        self.logical_type.physical_type()
    }

    /// Validates a non-null raw value for `field` and converts it to its
    /// storage representation.
    pub fn validate(&self, field: &str, raw: &Value) -> Result<CellValue, FieldError> {
        use LogicalType as T;

        match self.logical_type {
            T::ShortText { max_length } => {
                let text = expect_str(field, raw, "short_text")?;
                check_length(field, text, Some(*max_length))?;
                Ok(CellValue::Text(text.to_string()))
            }
            T::LongText { max_length } => {
                let text = expect_str(field, raw, "long_text")?;
                check_length(field, text, *max_length)?;
                Ok(CellValue::Text(text.to_string()))
            }
            T::Integer { min, max } => {
                let value = match raw {
                    Value::Number(n) if n.is_u64() && !n.is_i64() => {
                        return Err(FieldError::new(
                            field,
                            ReasonCode::OutOfRange,
                            format!("field '{}': {} does not fit a 64-bit integer", field, n),
                        ));
                    }
                    _ => raw
                        .as_i64()
                        .ok_or_else(|| FieldError::type_mismatch(field, "integer", json_type_name(raw)))?,
                };
                if min.map_or(false, |min| value < min) || max.map_or(false, |max| value > max) {
                    return Err(out_of_range(field, value as f64, min.map(|v| v as f64), max.map(|v| v as f64)));
                }
                Ok(CellValue::Integer(value))
            }
            T::Decimal { min, max } => {
                let value = match raw {
                    Value::Number(n) => n.as_f64(),
                    _ => None,
                }
                .filter(|v| v.is_finite())
                .ok_or_else(|| FieldError::type_mismatch(field, "decimal", json_type_name(raw)))?;
                if min.map_or(false, |min| value < min) || max.map_or(false, |max| value > max) {
                    return Err(out_of_range(field, value, *min, *max));
                }
                Ok(CellValue::Real(value))
            }
            T::Boolean => {
                let value = raw
                    .as_bool()
                    .ok_or_else(|| FieldError::type_mismatch(field, "boolean", json_type_name(raw)))?;
                Ok(CellValue::Integer(i64::from(value)))
            }
            T::Date => {
                let text = expect_str(field, raw, "date")?;
                let date = NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|_| {
                    FieldError::new(
                        field,
                        ReasonCode::InvalidFormat,
                        format!("field '{}': expected a date formatted YYYY-MM-DD", field),
                    )
                })?;
                Ok(CellValue::Text(date.format(DATE_FORMAT).to_string()))
            }
            T::Datetime => {
                let text = expect_str(field, raw, "datetime")?;
                let instant = DateTime::parse_from_rfc3339(text).map_err(|_| {
                    FieldError::new(
                        field,
                        ReasonCode::InvalidFormat,
                        format!("field '{}': expected an RFC 3339 datetime", field),
                    )
                })?;
                Ok(CellValue::Text(canonical_datetime(&instant.with_timezone(&Utc))))
            }
            T::Email => {
                let text = expect_str(field, raw, "email")?.trim();
                if text.chars().count() > MAX_EMAIL_LENGTH as usize {
                    return Err(too_long(field, MAX_EMAIL_LENGTH));
                }
                if !self.registry.email.is_match(text) {
                    return Err(FieldError::new(
                        field,
                        ReasonCode::InvalidFormat,
                        format!("field '{}': '{}' is not a valid email address", field, text),
                    ));
                }
                Ok(CellValue::Text(text.to_string()))
            }
            T::Choice { options } => {
                let text = expect_str(field, raw, "choice")?;
                if !options.iter().any(|o| o == text) {
                    return Err(FieldError::new(
                        field,
                        ReasonCode::NotInChoices,
                        format!(
                            "field '{}': '{}' is not one of [{}]",
                            field,
                            text,
                            options.join(", ")
                        ),
                    ));
                }
                Ok(CellValue::Text(text.to_string()))
            }
            T::Json => match raw {
                Value::Object(_) | Value::Array(_) => Ok(CellValue::Text(raw.to_string())),
                other => Err(FieldError::type_mismatch(
                    field,
                    "object or array",
                    json_type_name(other),
                )),
            },
        }
    }

    /// Converts a query operand to the storage class of this type.
    ///
    /// Only the type is checked. Bounds, lengths, options and the email
    /// format constrain stored values, not the values they are compared
    /// with.
    pub fn operand(&self, field: &str, raw: &Value) -> Result<CellValue, FieldError> {
        use LogicalType as T;

        let unconstrained = match self.logical_type {
            T::ShortText { .. } | T::LongText { .. } | T::Choice { .. } => {
                let text = expect_str(field, raw, self.logical_type.type_name())?;
                return Ok(CellValue::Text(text.to_string()));
            }
            T::Email => {
                let text = expect_str(field, raw, "email")?;
                return Ok(CellValue::Text(text.trim().to_string()));
            }
            T::Integer { .. } => T::integer(),
            T::Decimal { .. } => T::decimal(),
            other => other.clone(),
        };
        self.registry.resolve(&unconstrained).validate(field, raw)
    }

    /// Converts a stored value back to its wire representation.
    ///
    /// Never fails: values the engine hands back in an unexpected storage
    /// class are rendered as faithfully as possible.
    pub fn serialize(&self, value: &CellValue) -> Value {
        use LogicalType as T;

        match (self.logical_type, value) {
            (_, CellValue::Null) => Value::Null,
            (T::Boolean, CellValue::Integer(i)) => Value::Bool(*i != 0),
            (T::Decimal { .. }, CellValue::Integer(i)) => real_to_json(*i as f64),
            (T::Json, CellValue::Text(text)) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
            (_, CellValue::Integer(i)) => Value::Number((*i).into()),
            (_, CellValue::Real(f)) => real_to_json(*f),
            (_, CellValue::Text(text)) => Value::String(text.clone()),
        }
    }
}

/// Canonical storage form of a UTC instant. Fixed millisecond precision
/// keeps stored values ordered lexicographically.
pub fn canonical_datetime(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn real_to_json(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn expect_str<'v>(field: &str, raw: &'v Value, expected: &str) -> Result<&'v str, FieldError> {
    raw.as_str()
        .ok_or_else(|| FieldError::type_mismatch(field, expected, json_type_name(raw)))
}

fn check_length(field: &str, text: &str, max_length: Option<u32>) -> Result<(), FieldError> {
    match max_length {
        Some(limit) if text.chars().count() > limit as usize => Err(too_long(field, limit)),
        _ => Ok(()),
    }
}

fn too_long(field: &str, limit: u32) -> FieldError {
    FieldError::new(
        field,
        ReasonCode::TooLong,
        format!("field '{}' exceeds {} characters", field, limit),
    )
}

fn out_of_range(field: &str, value: f64, min: Option<f64>, max: Option<f64>) -> FieldError {
    let bound = match (min, max) {
        (Some(min), Some(max)) => format!("between {} and {}", min, max),
        (Some(min), None) => format!("at least {}", min),
        (None, Some(max)) => format!("at most {}", max),
        (None, None) => "in range".to_string(),
    };
    FieldError::new(
        field,
        ReasonCode::OutOfRange,
        format!("field '{}': {} is not {}", field, value, bound),
    )
}

/// Returns the JSON type name for error messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "decimal",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(ty: &LogicalType, raw: Value) {
        let registry = FieldTypeRegistry::new();
        let handler = registry.resolve(ty);
        let stored = handler.validate("f", &raw).unwrap();
        let wire = handler.serialize(&stored);
        let again = handler.validate("f", &wire).unwrap();
        assert_eq!(stored, again, "round trip of {} via {}", raw, ty);
    }

    #[test]
    fn test_accepted_values_round_trip() {
        round_trip(&LogicalType::short_text(), json!("Jean"));
        round_trip(&LogicalType::long_text(), json!("a much longer text"));
        round_trip(&LogicalType::integer(), json!(-42));
        round_trip(&LogicalType::decimal(), json!(3));
        round_trip(&LogicalType::decimal(), json!(2.75));
        round_trip(&LogicalType::Boolean, json!(true));
        round_trip(&LogicalType::Date, json!("2024-02-29"));
        round_trip(&LogicalType::Datetime, json!("2024-01-01T10:00:00+02:00"));
        round_trip(&LogicalType::Datetime, json!("2024-01-01T10:00:00.123456Z"));
        round_trip(&LogicalType::Email, json!("  jean@x.com "));
        round_trip(&LogicalType::choice(["lead", "client"]), json!("lead"));
        round_trip(&LogicalType::Json, json!({"tags": ["a", "b"], "n": 1}));
    }

    #[test]
    fn test_no_implicit_coercion() {
        let registry = FieldTypeRegistry::new();
        let ty = LogicalType::integer();
        let err = registry.resolve(&ty).validate("age", &json!("42")).unwrap_err();
        assert_eq!(err.reason, ReasonCode::TypeMismatch);
        assert_eq!(err.field, "age");

        let err = registry.resolve(&ty).validate("age", &json!(4.5)).unwrap_err();
        assert_eq!(err.reason, ReasonCode::TypeMismatch);
    }

    #[test]
    fn test_integer_overflow_is_out_of_range() {
        let registry = FieldTypeRegistry::new();
        let ty = LogicalType::integer();
        let err = registry
            .resolve(&ty)
            .validate("n", &json!(u64::MAX))
            .unwrap_err();
        assert_eq!(err.reason, ReasonCode::OutOfRange);
        assert!(!err.message.contains("got integer"));
        assert_eq!(
            registry.resolve(&ty).validate("n", &json!(i64::MAX)).unwrap(),
            CellValue::Integer(i64::MAX)
        );
    }

    #[test]
    fn test_operands_ignore_stored_value_constraints() {
        let registry = FieldTypeRegistry::new();
        let bounded = LogicalType::Integer {
            min: Some(0),
            max: Some(100),
        };
        assert_eq!(
            registry.resolve(&bounded).operand("age", &json!(150)).unwrap(),
            CellValue::Integer(150)
        );
        let err = registry.resolve(&bounded).operand("age", &json!("old")).unwrap_err();
        assert_eq!(err.reason, ReasonCode::TypeMismatch);

        let short = LogicalType::ShortText { max_length: 2 };
        assert!(registry.resolve(&short).operand("code", &json!("toolong")).is_ok());
        let choice = LogicalType::choice(["a", "b"]);
        assert!(registry.resolve(&choice).operand("tier", &json!("z")).is_ok());
        assert_eq!(
            registry
                .resolve(&LogicalType::Datetime)
                .operand("t", &json!("2024-01-01T10:00:00+02:00"))
                .unwrap(),
            CellValue::Text("2024-01-01T08:00:00.000Z".into())
        );
    }

    #[test]
    fn test_short_text_length_counts_characters() {
        let registry = FieldTypeRegistry::new();
        let ty = LogicalType::ShortText { max_length: 3 };
        assert!(registry.resolve(&ty).validate("f", &json!("été")).is_ok());
        let err = registry.resolve(&ty).validate("f", &json!("étés")).unwrap_err();
        assert_eq!(err.reason, ReasonCode::TooLong);
    }

    #[test]
    fn test_bounds_and_choices() {
        let registry = FieldTypeRegistry::new();
        let ty = LogicalType::Integer {
            min: Some(0),
            max: Some(10),
        };
        let err = registry.resolve(&ty).validate("n", &json!(11)).unwrap_err();
        assert_eq!(err.reason, ReasonCode::OutOfRange);

        let ty = LogicalType::choice(["a", "b"]);
        let err = registry.resolve(&ty).validate("c", &json!("z")).unwrap_err();
        assert_eq!(err.reason, ReasonCode::NotInChoices);
    }

    #[test]
    fn test_email_and_temporal_formats() {
        let registry = FieldTypeRegistry::new();
        let err = registry
            .resolve(&LogicalType::Email)
            .validate("email", &json!("not-an-email"))
            .unwrap_err();
        assert_eq!(err.reason, ReasonCode::InvalidFormat);

        let err = registry
            .resolve(&LogicalType::Date)
            .validate("d", &json!("2024-13-01"))
            .unwrap_err();
        assert_eq!(err.reason, ReasonCode::InvalidFormat);

        let stored = registry
            .resolve(&LogicalType::Datetime)
            .validate("t", &json!("2024-01-01T10:00:00+02:00"))
            .unwrap();
        assert_eq!(stored, CellValue::Text("2024-01-01T08:00:00.000Z".into()));
    }

    #[test]
    fn test_serialize_boolean_and_json() {
        let registry = FieldTypeRegistry::new();
        assert_eq!(
            registry.resolve(&LogicalType::Boolean).serialize(&CellValue::Integer(1)),
            json!(true)
        );
        assert_eq!(
            registry
                .resolve(&LogicalType::Json)
                .serialize(&CellValue::Text("[1,2]".into())),
            json!([1, 2])
        );
        assert_eq!(
            registry.resolve(&LogicalType::Email).serialize(&CellValue::Null),
            Value::Null
        );
    }
}
