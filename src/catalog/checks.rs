//! Definition checks shared by `create_table` and `alter_table`

use std::collections::HashSet;

use serde_json::Value;

use super::types::{FieldDefinition, FieldOp};
use crate::errors::{ErrorKind, FieldError, ReasonCode, TablesmithError};
use crate::identifier::{check_logical_name, IdentifierError};
use crate::registry::{classify, ChangeKind, FieldTypeRegistry, LogicalType};

pub(crate) fn name_error(field: &str, err: IdentifierError) -> FieldError {
    let reason = match err {
        IdentifierError::Reserved(_) => ReasonCode::ReservedName,
        _ => ReasonCode::InvalidName,
    };
    FieldError::new(field, reason, err.to_string())
}

fn duplicate(field: &str) -> FieldError {
    FieldError::new(
        field,
        ReasonCode::DuplicateName,
        format!("field '{}' is declared more than once", field),
    )
}

fn missing(field: &str) -> FieldError {
    FieldError::unknown_field(field)
}

/// Checks a default against the field's type. `null` counts as absent.
fn check_default(
    registry: &FieldTypeRegistry,
    name: &str,
    logical_type: &LogicalType,
    default: Option<&Value>,
) -> Option<FieldError> {
    let default = default.filter(|v| !v.is_null())?;
    registry
        .resolve(logical_type)
        .validate(name, default)
        .err()
        .map(|e| {
            FieldError::new(
                name,
                ReasonCode::InvalidDefault,
                format!("default for '{}' is invalid: {}", name, e.message),
            )
        })
}

/// Checks one field definition in isolation
pub(crate) fn check_field(registry: &FieldTypeRegistry, field: &FieldDefinition) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if let Err(e) = check_logical_name(&field.name) {
        errors.push(name_error(&field.name, e));
    }
    if let Err(reason) = field.logical_type.check_constraints() {
        errors.push(FieldError::new(&field.name, ReasonCode::InvalidFormat, reason));
    }
    if errors.is_empty() {
        errors.extend(check_default(
            registry,
            &field.name,
            &field.logical_type,
            field.default.as_ref(),
        ));
    }
    errors
}

/// Checks the fields of a new table
pub(crate) fn check_fields(registry: &FieldTypeRegistry, fields: &[FieldDefinition]) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            errors.push(duplicate(&field.name));
            continue;
        }
        errors.extend(check_field(registry, field));
    }
    errors
}

/// Collisions are reported as `Conflict`, everything else as a
/// validation failure.
pub(crate) fn into_error(errors: Vec<FieldError>) -> TablesmithError {
    let collision = errors.iter().any(|e| {
        matches!(
            e.reason,
            ReasonCode::DuplicateName | ReasonCode::ReservedName
        )
    });
    if collision {
        TablesmithError::new(ErrorKind::Conflict, "field definitions collide")
            .with_field_errors(errors)
    } else {
        TablesmithError::validation(errors)
    }
}

/// Outcome of applying field ops to a definition
#[derive(Debug, Default)]
pub(crate) struct AppliedOps {
    pub fields: Vec<FieldDefinition>,
    /// Fields removed or narrowed; need confirmation
    pub destructive: Vec<String>,
    /// Fields changing type without a conversion path
    pub incompatible: Vec<String>,
}

/// Applies every op to a copy of `fields`, collecting all errors.
pub(crate) fn apply_ops(
    registry: &FieldTypeRegistry,
    fields: &[FieldDefinition],
    ops: &[FieldOp],
) -> Result<AppliedOps, Vec<FieldError>> {
    let mut out = AppliedOps {
        fields: fields.to_vec(),
        ..Default::default()
    };
    let mut errors = Vec::new();

    for op in ops {
        let target = op.target().to_string();
        let exists = out.fields.iter().any(|f| f.name == target);
        match op {
            FieldOp::Add { field } => {
                if exists {
                    errors.push(duplicate(&field.name));
                    continue;
                }
                let field_errors = check_field(registry, field);
                if field_errors.is_empty() {
                    out.fields.push(field.clone());
                } else {
                    errors.extend(field_errors);
                }
                continue;
            }
            _ if !exists => {
                errors.push(missing(&target));
                continue;
            }
            _ => {}
        }

        match op {
            FieldOp::Add { .. } => {}
            FieldOp::Remove { name } => {
                out.fields.retain(|f| &f.name != name);
                out.destructive.push(name.clone());
            }
            FieldOp::Rename { from, to } => {
                if let Err(e) = check_logical_name(to) {
                    errors.push(name_error(to, e));
                } else if out.fields.iter().any(|f| &f.name == to) {
                    errors.push(duplicate(to));
                } else if let Some(field) = out.fields.iter_mut().find(|f| &f.name == from) {
                    field.name = to.clone();
                }
            }
            FieldOp::ChangeType { name, to } => {
                if let Err(reason) = to.check_constraints() {
                    errors.push(FieldError::new(name, ReasonCode::InvalidFormat, reason));
                    continue;
                }
                if let Some(field) = out.fields.iter_mut().find(|f| &f.name == name) {
                    match classify(&field.logical_type, to).kind {
                        ChangeKind::Narrowing => out.destructive.push(name.clone()),
                        ChangeKind::Incompatible => out.incompatible.push(name.clone()),
                        ChangeKind::Identical | ChangeKind::Widening => {}
                    }
                    if let Some(e) = check_default(registry, name, to, field.default.as_ref()) {
                        errors.push(e);
                    }
                    field.logical_type = to.clone();
                }
            }
            FieldOp::SetRequired { name, required } => {
                if let Some(field) = out.fields.iter_mut().find(|f| &f.name == name) {
                    field.required = *required;
                }
            }
            FieldOp::SetUnique { name, unique } => {
                if let Some(field) = out.fields.iter_mut().find(|f| &f.name == name) {
                    field.unique = *unique;
                }
            }
            FieldOp::SetDefault { name, default } => {
                if let Some(field) = out.fields.iter_mut().find(|f| &f.name == name) {
                    match check_default(registry, name, &field.logical_type, default.as_ref()) {
                        Some(e) => errors.push(e),
                        None => field.default = default.clone().filter(|v| !v.is_null()),
                    }
                }
            }
            FieldOp::SetDisplay { name, display } => {
                if let Some(field) = out.fields.iter_mut().find(|f| &f.name == name) {
                    field.display = display.clone();
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("name", LogicalType::short_text()).required(),
            FieldDefinition::new("email", LogicalType::long_text()),
        ]
    }

    #[test]
    fn test_check_fields_collects_every_error() {
        let registry = FieldTypeRegistry::new();
        let errors = check_fields(
            &registry,
            &[
                FieldDefinition::new("a", LogicalType::integer()),
                FieldDefinition::new("a", LogicalType::integer()),
                FieldDefinition::new("_id", LogicalType::integer()),
                FieldDefinition::new("n", LogicalType::integer()).with_default(json!("x")),
                FieldDefinition::new("c", LogicalType::choice(Vec::<String>::new())),
            ],
        );
        let reasons: Vec<ReasonCode> = errors.iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            vec![
                ReasonCode::DuplicateName,
                ReasonCode::ReservedName,
                ReasonCode::InvalidDefault,
                ReasonCode::InvalidFormat,
            ]
        );
        assert_eq!(into_error(errors).kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_apply_ops_is_all_or_nothing() {
        let registry = FieldTypeRegistry::new();
        let ops = vec![
            FieldOp::Add {
                field: FieldDefinition::new("phone", LogicalType::short_text()),
            },
            FieldOp::Remove {
                name: "missing".into(),
            },
        ];
        let errors = apply_ops(&registry, &fields(), &ops).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].reason, ReasonCode::UnknownField);
    }

    #[test]
    fn test_apply_ops_tracks_destructive_changes() {
        let registry = FieldTypeRegistry::new();
        let ops = vec![
            FieldOp::ChangeType {
                name: "email".into(),
                to: LogicalType::short_text(),
            },
            FieldOp::Remove {
                name: "name".into(),
            },
        ];
        let applied = apply_ops(&registry, &fields(), &ops).unwrap();
        assert_eq!(applied.destructive, vec!["email".to_string(), "name".to_string()]);
        assert_eq!(applied.fields.len(), 1);
    }

    #[test]
    fn test_rename_then_ops_use_new_name() {
        let registry = FieldTypeRegistry::new();
        let ops = vec![
            FieldOp::Rename {
                from: "name".into(),
                to: "full_name".into(),
            },
            FieldOp::SetRequired {
                name: "full_name".into(),
                required: false,
            },
        ];
        let applied = apply_ops(&registry, &fields(), &ops).unwrap();
        assert_eq!(applied.fields[0].name, "full_name");
        assert!(!applied.fields[0].required);
    }

    #[test]
    fn test_change_type_revalidates_default() {
        let registry = FieldTypeRegistry::new();
        let base = vec![FieldDefinition::new("n", LogicalType::short_text()).with_default(json!("abc"))];
        let ops = vec![FieldOp::ChangeType {
            name: "n".into(),
            to: LogicalType::integer(),
        }];
        let errors = apply_ops(&registry, &base, &ops).unwrap_err();
        assert_eq!(errors[0].reason, ReasonCode::InvalidDefault);
    }
}
