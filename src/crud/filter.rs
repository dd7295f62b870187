//! # Filter Expressions
//!
//! Filters name logical fields. They compile to SQL conditions over the
//! physical columns with every value bound as a parameter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::TableDefinition;
use crate::errors::{FieldError, ReasonCode, TablesmithError, TablesmithResult};
use crate::identifier::{IdentifierMapper, PhysicalIdent};
use crate::registry::{json_type_name, CellValue, FieldTypeRegistry, LogicalType, PhysicalType, TypeHandler};

/// Filter operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// Equals
    Eq,

    /// Not equals
    Neq,

    /// Greater than
    Gt,

    /// Greater than or equal
    Gte,

    /// Less than
    Lt,

    /// Less than or equal
    Lte,

    /// Pattern match (LIKE) on text columns
    Like,

    /// Value in list
    In,

    IsNull,

    IsNotNull,
}

impl FilterOperator {
    /// Get the operator string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::Like => "like",
            FilterOperator::In => "in",
            FilterOperator::IsNull => "is_null",
            FilterOperator::IsNotNull => "is_not_null",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "eq" => FilterOperator::Eq,
            "neq" => FilterOperator::Neq,
            "gt" => FilterOperator::Gt,
            "gte" => FilterOperator::Gte,
            "lt" => FilterOperator::Lt,
            "lte" => FilterOperator::Lte,
            "like" => FilterOperator::Like,
            "in" => FilterOperator::In,
            "is_null" => FilterOperator::IsNull,
            "is_not_null" => FilterOperator::IsNotNull,
            _ => return None,
        })
    }

    /// SQL comparison for the single-value operators
    fn comparison(&self) -> Option<&'static str> {
        match self {
            FilterOperator::Eq => Some("="),
            FilterOperator::Neq => Some("<>"),
            FilterOperator::Gt => Some(">"),
            FilterOperator::Gte => Some(">="),
            FilterOperator::Lt => Some("<"),
            FilterOperator::Lte => Some("<="),
            _ => None,
        }
    }
}

/// A filter expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on
    pub field: String,

    /// Comparison operator
    #[serde(alias = "op")]
    pub operator: FilterOperator,

    /// Value to compare against; ignored by the null checks
    #[serde(default)]
    pub value: Value,

    /// The value is query-string text, read according to the field's
    /// type when the filter is compiled
    #[serde(skip)]
    pub from_text: bool,
}

impl FilterExpr {
    /// Create a new filter expression
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            from_text: false,
        }
    }

    /// A filter whose value is raw text (a string, or an array of strings
    /// for `in`)
    pub fn from_text(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            from_text: true,
            ..Self::new(field, operator, value)
        }
    }

    /// Create an equality filter
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create a greater than filter
    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Gt, value)
    }

    /// Create an "in list" filter
    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOperator::In, Value::Array(values))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNull, Value::Null)
    }
}

/// A column a query may filter or sort on
#[derive(Debug, Clone)]
pub(crate) struct QueryColumn {
    pub ident: PhysicalIdent,
    pub logical_type: LogicalType,
}

/// Resolves a declared field or a queryable system field to its column
pub(crate) fn resolve_column(
    mapper: &IdentifierMapper,
    table: &TableDefinition,
    field: &str,
) -> TablesmithResult<QueryColumn> {
    let system = |name: &'static str, logical_type: LogicalType| QueryColumn {
        ident: PhysicalIdent::system(name),
        logical_type,
    };
    match field {
        "_id" => Ok(system("_id", LogicalType::LongText { max_length: None })),
        "_created_at" => Ok(system("_created_at", LogicalType::Datetime)),
        "_updated_at" => Ok(system("_updated_at", LogicalType::Datetime)),
        _ => {
            let def = table
                .field(field)
                .ok_or_else(|| TablesmithError::unknown_field(field).with_table(table.logical_name.clone()))?;
            let ident = mapper.column(&def.name).map_err(|e| {
                TablesmithError::internal(format!("field '{}' has no column: {}", def.name, e))
            })?;
            Ok(QueryColumn {
                ident,
                logical_type: def.logical_type.clone(),
            })
        }
    }
}

/// Conditions joined with AND, with their parameters in placeholder order
#[derive(Debug, Clone)]
pub(crate) struct WhereClause {
    conditions: Vec<String>,
    pub params: Vec<CellValue>,
}

impl WhereClause {
    /// Starts with the live-row condition every read carries
    pub fn live_rows() -> Self {
        Self {
            conditions: vec!["\"_deleted_at\" IS NULL".to_string()],
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, condition: String, params: Vec<CellValue>) {
        self.conditions.push(condition);
        self.params.extend(params);
    }

    pub fn sql(&self) -> String {
        self.conditions.join(" AND ")
    }
}

/// Compiles filters against the table definition.
///
/// Unknown fields fail fast with `UnknownField`; value errors are
/// collected across every filter.
pub(crate) fn compile(
    registry: &FieldTypeRegistry,
    mapper: &IdentifierMapper,
    table: &TableDefinition,
    filters: &[FilterExpr],
) -> TablesmithResult<WhereClause> {
    let mut clause = WhereClause::live_rows();
    let mut errors = Vec::new();

    for filter in filters {
        let column = resolve_column(mapper, table, &filter.field)?;
        let quoted = column.ident.quoted();
        let handler = registry.resolve(&column.logical_type);
        let typed;
        let value = if filter.from_text {
            typed = read_text(&column.logical_type, &filter.value);
            &typed
        } else {
            &filter.value
        };

        match filter.operator {
            FilterOperator::IsNull => clause.push(format!("{} IS NULL", quoted), Vec::new()),
            FilterOperator::IsNotNull => clause.push(format!("{} IS NOT NULL", quoted), Vec::new()),
            FilterOperator::Like => {
                if handler.physical_type() != PhysicalType::Text {
                    errors.push(FieldError::new(
                        filter.field.as_str(),
                        ReasonCode::TypeMismatch,
                        format!(
                            "like needs a text field; '{}' is {}",
                            filter.field,
                            column.logical_type.type_name()
                        ),
                    ));
                    continue;
                }
                match value.as_str() {
                    Some(pattern) => clause.push(
                        format!("{} LIKE ?", quoted),
                        vec![CellValue::Text(pattern.to_string())],
                    ),
                    None => errors.push(FieldError::type_mismatch(
                        filter.field.as_str(),
                        "string pattern",
                        json_type_name(value),
                    )),
                }
            }
            FilterOperator::In => {
                let Some(items) = value.as_array() else {
                    errors.push(FieldError::type_mismatch(
                        filter.field.as_str(),
                        "array",
                        json_type_name(value),
                    ));
                    continue;
                };
                if items.is_empty() {
                    clause.push("0 = 1".to_string(), Vec::new());
                    continue;
                }
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match filter_value(&handler, &filter.field, item) {
                        Ok(value) => values.push(value),
                        Err(e) => errors.push(e),
                    }
                }
                if values.len() == items.len() {
                    let placeholders = vec!["?"; values.len()].join(", ");
                    clause.push(format!("{} IN ({})", quoted, placeholders), values);
                }
            }
            op => {
                let Some(comparison) = op.comparison() else { continue };
                match filter_value(&handler, &filter.field, value) {
                    Ok(value) => clause.push(format!("{} {} ?", quoted, comparison), vec![value]),
                    Err(e) => errors.push(e),
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(clause)
    } else {
        Err(TablesmithError::validation(errors).with_table(table.logical_name.clone()))
    }
}

/// Converts one filter operand into its stored representation
fn filter_value(
    handler: &TypeHandler<'_>,
    field: &str,
    raw: &Value,
) -> Result<CellValue, FieldError> {
    if raw.is_null() {
        return Err(FieldError::new(
            field,
            ReasonCode::TypeMismatch,
            format!("filter on '{}' compares with null; use is_null or is_not_null", field),
        ));
    }
    handler.operand(field, raw)
}

/// Reads query-string text as the JSON value the field's type expects.
/// Text that does not parse stays a string and fails type checking.
fn read_text(logical_type: &LogicalType, raw: &Value) -> Value {
    match raw {
        Value::String(text) => read_text_scalar(logical_type, text),
        Value::Array(items) => Value::Array(items.iter().map(|item| read_text(logical_type, item)).collect()),
        other => other.clone(),
    }
}

fn read_text_scalar(logical_type: &LogicalType, text: &str) -> Value {
    let parsed = match logical_type {
        LogicalType::Integer { .. } => text
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.parse::<u64>().map(Value::from))
            .ok(),
        LogicalType::Decimal { .. } => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        LogicalType::Boolean => match text {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        LogicalType::Json => serde_json::from_str(text).ok(),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(text.to_string()))
}
