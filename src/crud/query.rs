//! # List Queries
//!
//! Filter, sort and page parameters for `list`, either built directly or
//! parsed from `key=value` pairs (`age=gt.18`, `order=name.desc`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::filter::{FilterExpr, FilterOperator};
use crate::errors::{FieldError, ReasonCode, TablesmithError, TablesmithResult};

/// Hard cap on the page size unless configured otherwise
pub const MAX_PAGE_SIZE: usize = 1000;

/// Page size when the query does not name one
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Largest offset the engine accepts (a signed 64-bit value)
pub const MAX_OFFSET: usize = i64::MAX as usize;

fn ascending_default() -> bool {
    true
}

/// Order by clause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default = "ascending_default")]
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// Parameters of one `list` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    /// Filter expressions, joined with AND
    pub filters: Vec<FilterExpr>,

    /// Order by clauses; ties fall back to creation order
    pub order: Vec<OrderBy>,

    /// Number of records to return
    pub limit: Option<usize>,

    /// Number of records to skip
    pub offset: usize,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: FilterExpr) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Parse query parameters from `key=value` pairs
    pub fn from_pairs<'a, I>(pairs: I) -> TablesmithResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut query = ListQuery::default();
        for (key, value) in pairs {
            match key {
                "order" => query.order = parse_order(value)?,
                "limit" => query.limit = Some(parse_count("limit", value)?),
                "offset" => query.offset = parse_count("offset", value)?,
                field => query.filters.push(parse_filter(field, value)),
            }
        }
        Ok(query)
    }

    /// Offset as the engine can take it
    pub fn page_offset(&self) -> TablesmithResult<usize> {
        if self.offset > MAX_OFFSET {
            return Err(TablesmithError::validation(vec![FieldError::new(
                "offset",
                ReasonCode::OutOfRange,
                format!("offset must be at most {}", MAX_OFFSET),
            )]));
        }
        Ok(self.offset)
    }

    /// Effective page size, rejecting sizes over `max`
    pub fn page_size(&self, default: usize, max: usize) -> TablesmithResult<usize> {
        match self.limit {
            None => Ok(default.min(max)),
            Some(0) => Err(TablesmithError::validation(vec![FieldError::new(
                "limit",
                ReasonCode::OutOfRange,
                "limit must be at least 1",
            )])),
            Some(limit) if limit > max => Err(TablesmithError::validation(vec![FieldError::new(
                "limit",
                ReasonCode::PageSizeExceeded,
                format!("limit {} exceeds the maximum page size of {}", limit, max),
            )])),
            Some(limit) => Ok(limit),
        }
    }
}

fn invalid(param: &str, message: String) -> TablesmithError {
    TablesmithError::validation(vec![FieldError::new(param, ReasonCode::InvalidFormat, message)])
}

/// Parse order parameter (comma-separated field.direction)
fn parse_order(value: &str) -> TablesmithResult<Vec<OrderBy>> {
    let mut orders = Vec::new();

    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let order = match part.rsplit_once('.') {
            Some((field, direction)) => match direction.to_lowercase().as_str() {
                "asc" => OrderBy::asc(field),
                "desc" => OrderBy::desc(field),
                _ => {
                    return Err(invalid(
                        "order",
                        format!("invalid order direction: {}", direction),
                    ))
                }
            },
            None => OrderBy::asc(part),
        };
        orders.push(order);
    }

    Ok(orders)
}

fn parse_count(param: &str, value: &str) -> TablesmithResult<usize> {
    value
        .parse()
        .map_err(|_| invalid(param, format!("invalid {}: {}", param, value)))
}

/// Parse a filter from `field=op.value`; a bare value means `eq`.
///
/// Values stay text here: only the table definition knows whether
/// `75001` is a number or a postal code.
fn parse_filter(field: &str, value: &str) -> FilterExpr {
    let parsed = value
        .split_once('.')
        .and_then(|(op, rest)| FilterOperator::parse(op).map(|op| (op, rest)));

    match parsed {
        Some((FilterOperator::In, rest)) => FilterExpr::from_text(field, FilterOperator::In, parse_list(rest)),
        Some((op, rest)) => FilterExpr::from_text(field, op, Value::String(rest.to_string())),
        None => match value {
            "is_null" => FilterExpr::is_null(field),
            "is_not_null" => FilterExpr::new(field, FilterOperator::IsNotNull, Value::Null),
            _ => FilterExpr::from_text(field, FilterOperator::Eq, Value::String(value.to_string())),
        },
    }
}

/// Parse list syntax: (a,b,c)
fn parse_list(value: &str) -> Value {
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(value);
    Value::Array(
        inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect(),
    )
}
