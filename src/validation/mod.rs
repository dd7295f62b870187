//! Dynamic Validator
//!
//! Validates a raw record (a JSON object) against a live table definition.
//!
//! - `create` requires every required field lacking a default and fills
//!   defaults; `update` checks only the supplied fields
//! - Unknown fields are dropped unless strict mode is on
//! - Every field error is collected, not only the first
//! - Uniqueness is checked through an advisory probe; the storage unique
//!   index remains the final arbiter

use serde_json::{Map, Value};

use crate::catalog::{FieldDefinition, TableDefinition};
use crate::errors::{FieldError, ReasonCode, TablesmithError, TablesmithResult};
use crate::registry::{json_type_name, CellValue, FieldTypeRegistry};

/// Whether a write creates a record or patches an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode<'a> {
    Create,
    Update { record_id: &'a str },
}

/// Validator switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Reject fields the table does not declare
    pub strict: bool,
}

/// Answers "is this value already used by another live record?"
pub trait UniquenessProbe {
    fn is_taken(
        &self,
        field: &FieldDefinition,
        value: &CellValue,
        exclude_record: Option<&str>,
    ) -> TablesmithResult<bool>;
}

/// Probe that never reports a collision
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUniquenessProbe;

impl UniquenessProbe for NoUniquenessProbe {
    fn is_taken(&self, _: &FieldDefinition, _: &CellValue, _: Option<&str>) -> TablesmithResult<bool> {
        Ok(false)
    }
}

/// Values ready to be written, in table field order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidatedRecord {
    pub values: Vec<(String, CellValue)>,
    /// Unknown fields dropped in lenient mode
    pub dropped: Vec<String>,
}

impl ValidatedRecord {
    pub fn get(&self, field: &str) -> Option<&CellValue> {
        self.values.iter().find(|(f, _)| f == field).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Validates records against table definitions
#[derive(Debug, Clone)]
pub struct DynamicValidator<'r> {
    registry: &'r FieldTypeRegistry,
}

impl<'r> DynamicValidator<'r> {
    pub fn new(registry: &'r FieldTypeRegistry) -> Self {
        Self { registry }
    }

    pub fn validate_record(
        &self,
        table: &TableDefinition,
        raw: &Value,
        mode: WriteMode<'_>,
        options: ValidationOptions,
        probe: &dyn UniquenessProbe,
    ) -> TablesmithResult<ValidatedRecord> {
        let object = match raw {
            Value::Object(map) => map,
            other => {
                return Err(TablesmithError::validation(vec![FieldError::type_mismatch(
                    "record",
                    "object",
                    json_type_name(other),
                )])
                .with_table(table.logical_name.clone()))
            }
        };

        let mut errors = Vec::new();
        let mut record = ValidatedRecord::default();

        for key in object.keys() {
            if table.field(key).is_none() {
                if options.strict {
                    errors.push(FieldError::unknown_field(key.as_str()));
                } else {
                    record.dropped.push(key.clone());
                }
            }
        }

        for field in &table.fields {
            match self.field_value(field, object, mode) {
                Ok(Some(value)) => record.values.push((field.name.clone(), value)),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }

        let exclude = match mode {
            WriteMode::Create => None,
            WriteMode::Update { record_id } => Some(record_id),
        };
        for (name, value) in &record.values {
            let Some(field) = table.field(name) else { continue };
            if !field.unique || value.is_null() {
                continue;
            }
            if probe.is_taken(field, value, exclude)? {
                errors.push(FieldError::not_unique(name.as_str()));
            }
        }

        if errors.is_empty() {
            return Ok(record);
        }
        // Collisions alone surface as Conflict, matching what the storage
        // unique index reports when the probe loses a race.
        let error = if errors.iter().all(|e| e.reason == ReasonCode::NotUnique) {
            TablesmithError::unique_violation(errors[0].field.clone()).with_field_errors(errors)
        } else {
            TablesmithError::validation(errors)
        };
        Err(error.with_table(table.logical_name.clone()))
    }

    /// Validated value for one field, or `None` when the field is left out
    fn field_value(
        &self,
        field: &FieldDefinition,
        object: &Map<String, Value>,
        mode: WriteMode<'_>,
    ) -> Result<Option<CellValue>, FieldError> {
        let handler = self.registry.resolve(&field.logical_type);
        match object.get(&field.name) {
            Some(Value::Null) if field.required => Err(FieldError::new(
                field.name.as_str(),
                ReasonCode::NullNotAllowed,
                format!("field '{}' is required and cannot be null", field.name),
            )),
            Some(Value::Null) => Ok(Some(CellValue::Null)),
            Some(raw) => handler.validate(&field.name, raw).map(Some),
            None => match mode {
                WriteMode::Update { .. } => Ok(None),
                WriteMode::Create => match field.default.as_ref().filter(|d| !d.is_null()) {
                    Some(default) => handler.validate(&field.name, default).map(Some),
                    None if field.required => Err(FieldError::required(field.name.as_str())),
                    None => Ok(Some(CellValue::Null)),
                },
            },
        }
    }
}
