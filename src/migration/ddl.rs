//! DDL Synthesizer
//!
//! Plans the ordered structural operations that take a physical table from
//! its last applied definition to the one a schema version describes, and
//! executes them on a transaction.
//!
//! Every structural token comes from a `PhysicalIdent`; every user value is
//! a bound parameter.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use thiserror::Error;

use crate::catalog::{FieldDefinition, FieldOp, OverflowPolicy, TableDefinition};
use crate::identifier::{IdentifierError, IdentifierMapper, PhysicalIdent};
use crate::registry::{classify, CellValue, ChangeKind, FieldTypeRegistry, PhysicalType, ValueTransform};
use crate::storage::{table_has_rows, StorageError};

/// System columns carried by every user table, in order
pub const SYSTEM_COLUMNS: [&str; 4] = ["_id", "_created_at", "_updated_at", "_deleted_at"];

/// Why a schema version could not be applied. Messages name logical
/// fields only, so they are safe to hand to collaborators.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("field '{field}' has duplicate values; unique constraint cannot be enforced")]
    DuplicateValues { field: String },

    #[error("{rows} value(s) of field '{field}' do not fit the new type and the overflow policy is reject")]
    OverflowRejected { field: String, rows: u64 },

    #[error("field '{field}' cannot change type incompatibly while the table holds records")]
    TableNotEmpty { field: String },

    #[error("field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("migration cancelled")]
    Cancelled,

    #[error("storage failure while migrating")]
    Storage(#[source] StorageError),
}

impl From<StorageError> for MigrationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => MigrationError::Cancelled,
            other => MigrationError::Storage(other),
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        MigrationError::from(StorageError::from(err))
    }
}

/// Column of the physical table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub field: String,
    pub column: PhysicalIdent,
    pub physical_type: PhysicalType,
}

/// Partial unique index over live rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub field: String,
    pub index: PhysicalIdent,
    pub column: PhysicalIdent,
}

/// One step of a migration
#[derive(Debug, Clone, PartialEq)]
pub enum StructuralOp {
    CreateTable {
        table: PhysicalIdent,
        columns: Vec<ColumnSpec>,
        indexes: Vec<IndexSpec>,
    },
    AddColumn {
        table: PhysicalIdent,
        column: ColumnSpec,
        backfill: Option<CellValue>,
    },
    RenameColumn {
        table: PhysicalIdent,
        from: PhysicalIdent,
        to: PhysicalIdent,
    },
    TransformValues {
        table: PhysicalIdent,
        field: String,
        column: PhysicalIdent,
        transform: ValueTransform,
        overflow: OverflowPolicy,
    },
    AssertEmpty {
        table: PhysicalIdent,
        field: String,
    },
    RebuildTable {
        table: PhysicalIdent,
        scratch: PhysicalIdent,
        columns: Vec<ColumnSpec>,
        indexes: Vec<IndexSpec>,
    },
    CreateUniqueIndex {
        table: PhysicalIdent,
        index: IndexSpec,
    },
    DropUniqueIndex {
        index: PhysicalIdent,
    },
}

/// Result of executing a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Rows rewritten by lossy transforms
    pub lossy_rows: u64,
}

/// Working model of the physical table while ops are planned
struct WorkingTable {
    table: PhysicalIdent,
    columns: Vec<ColumnSpec>,
    unique: Vec<String>,
}

impl WorkingTable {
    fn column(&self, field: &str) -> Result<&ColumnSpec, MigrationError> {
        self.columns
            .iter()
            .find(|c| c.field == field)
            .ok_or_else(|| MigrationError::InvalidField {
                field: field.to_string(),
                reason: "not present in the applied definition".into(),
            })
    }

    fn indexes(&self, mapper: &IdentifierMapper) -> Vec<IndexSpec> {
        self.columns
            .iter()
            .filter(|c| self.unique.contains(&c.field))
            .map(|c| index_spec(mapper, &self.table, c))
            .collect()
    }

    fn rebuild(&self, mapper: &IdentifierMapper) -> StructuralOp {
        StructuralOp::RebuildTable {
            table: self.table.clone(),
            scratch: mapper.rebuild_scratch(&self.table),
            columns: self.columns.clone(),
            indexes: self.indexes(mapper),
        }
    }
}

fn index_spec(mapper: &IdentifierMapper, table: &PhysicalIdent, column: &ColumnSpec) -> IndexSpec {
    IndexSpec {
        field: column.field.clone(),
        index: mapper.unique_index(table, &column.column),
        column: column.column.clone(),
    }
}

fn column_spec(mapper: &IdentifierMapper, field: &FieldDefinition) -> Result<ColumnSpec, MigrationError> {
    Ok(ColumnSpec {
        field: field.name.clone(),
        column: mapper.column(&field.name).map_err(|e| invalid(&field.name, e))?,
        physical_type: field.physical_type(),
    })
}

fn invalid(field: &str, err: IdentifierError) -> MigrationError {
    MigrationError::InvalidField {
        field: field.to_string(),
        reason: err.to_string(),
    }
}

/// Plans the creation of a table
pub fn plan_create(mapper: &IdentifierMapper, def: &TableDefinition) -> Result<Vec<StructuralOp>, MigrationError> {
    let columns = def
        .fields
        .iter()
        .map(|f| column_spec(mapper, f))
        .collect::<Result<Vec<_>, _>>()?;
    let indexes = columns
        .iter()
        .filter(|c| def.field(&c.field).map_or(false, |f| f.unique))
        .map(|c| index_spec(mapper, &def.physical_name, c))
        .collect();
    Ok(vec![StructuralOp::CreateTable {
        table: def.physical_name.clone(),
        columns,
        indexes,
    }])
}

/// Plans the field ops of one version against the last applied definition.
///
/// The ops were checked by the catalog when the version was recorded;
/// planning only fails if the log is inconsistent with the definition.
pub fn plan_alter(
    mapper: &IdentifierMapper,
    registry: &FieldTypeRegistry,
    previous: &TableDefinition,
    ops: &[FieldOp],
    overflow: OverflowPolicy,
) -> Result<Vec<StructuralOp>, MigrationError> {
    let mut work = WorkingTable {
        table: previous.physical_name.clone(),
        columns: previous
            .fields
            .iter()
            .map(|f| column_spec(mapper, f))
            .collect::<Result<Vec<_>, _>>()?,
        unique: previous
            .fields
            .iter()
            .filter(|f| f.unique)
            .map(|f| f.name.clone())
            .collect(),
    };
    let mut types: Vec<(String, crate::registry::LogicalType)> = previous
        .fields
        .iter()
        .map(|f| (f.name.clone(), f.logical_type.clone()))
        .collect();
    let mut steps = Vec::new();

    for op in ops {
        match op {
            FieldOp::Add { field } => {
                let column = column_spec(mapper, field)?;
                let backfill = match &field.default {
                    Some(default) if !default.is_null() => Some(
                        registry
                            .resolve(&field.logical_type)
                            .validate(&field.name, default)
                            .map_err(|e| MigrationError::InvalidField {
                                field: field.name.clone(),
                                reason: e.message,
                            })?,
                    ),
                    _ => None,
                };
                steps.push(StructuralOp::AddColumn {
                    table: work.table.clone(),
                    column: column.clone(),
                    backfill,
                });
                if field.unique {
                    steps.push(StructuralOp::CreateUniqueIndex {
                        table: work.table.clone(),
                        index: index_spec(mapper, &work.table, &column),
                    });
                    work.unique.push(field.name.clone());
                }
                work.columns.push(column);
                types.push((field.name.clone(), field.logical_type.clone()));
            }
            FieldOp::Remove { name } => {
                work.column(name)?;
                work.columns.retain(|c| &c.field != name);
                work.unique.retain(|u| u != name);
                types.retain(|(n, _)| n != name);
                steps.push(work.rebuild(mapper));
            }
            FieldOp::Rename { from, to } => {
                let old = work.column(from)?.clone();
                let new_column = mapper.column(to).map_err(|e| invalid(to, e))?;
                let was_unique = work.unique.contains(from);
                if was_unique {
                    steps.push(StructuralOp::DropUniqueIndex {
                        index: mapper.unique_index(&work.table, &old.column),
                    });
                }
                steps.push(StructuralOp::RenameColumn {
                    table: work.table.clone(),
                    from: old.column.clone(),
                    to: new_column.clone(),
                });
                let renamed = ColumnSpec {
                    field: to.clone(),
                    column: new_column,
                    physical_type: old.physical_type,
                };
                if was_unique {
                    steps.push(StructuralOp::CreateUniqueIndex {
                        table: work.table.clone(),
                        index: index_spec(mapper, &work.table, &renamed),
                    });
                    for u in work.unique.iter_mut().filter(|u| *u == from) {
                        *u = to.clone();
                    }
                }
                for c in work.columns.iter_mut().filter(|c| &c.field == from) {
                    *c = renamed.clone();
                }
                for (n, _) in types.iter_mut().filter(|(n, _)| n == from) {
                    *n = to.clone();
                }
            }
            FieldOp::ChangeType { name, to } => {
                let column = work.column(name)?.clone();
                let from = types
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, t)| t.clone())
                    .ok_or_else(|| MigrationError::InvalidField {
                        field: name.clone(),
                        reason: "type unknown".into(),
                    })?;
                let change = classify(&from, to);
                if change.kind == ChangeKind::Identical {
                    continue;
                }
                if change.kind == ChangeKind::Incompatible {
                    steps.push(StructuralOp::AssertEmpty {
                        table: work.table.clone(),
                        field: name.clone(),
                    });
                }
                for transform in change.transforms {
                    steps.push(StructuralOp::TransformValues {
                        table: work.table.clone(),
                        field: name.clone(),
                        column: column.column.clone(),
                        transform,
                        overflow,
                    });
                }
                for (_, t) in types.iter_mut().filter(|(n, _)| n == name) {
                    *t = to.clone();
                }
                let target = to.physical_type();
                if target != column.physical_type {
                    for c in work.columns.iter_mut().filter(|c| &c.field == name) {
                        c.physical_type = target;
                    }
                    steps.push(work.rebuild(mapper));
                }
            }
            FieldOp::SetUnique { name, unique } => {
                let column = work.column(name)?.clone();
                let already = work.unique.contains(name);
                if *unique && !already {
                    steps.push(StructuralOp::CreateUniqueIndex {
                        table: work.table.clone(),
                        index: index_spec(mapper, &work.table, &column),
                    });
                    work.unique.push(name.clone());
                } else if !*unique && already {
                    steps.push(StructuralOp::DropUniqueIndex {
                        index: mapper.unique_index(&work.table, &column.column),
                    });
                    work.unique.retain(|u| u != name);
                }
            }
            FieldOp::SetRequired { .. } | FieldOp::SetDefault { .. } | FieldOp::SetDisplay { .. } => {}
        }
    }

    Ok(steps)
}

fn column_defs(columns: &[ColumnSpec]) -> String {
    let mut defs = vec![
        "\"_id\" TEXT PRIMARY KEY NOT NULL".to_string(),
        "\"_created_at\" TEXT NOT NULL".to_string(),
        "\"_updated_at\" TEXT NOT NULL".to_string(),
        "\"_deleted_at\" TEXT".to_string(),
    ];
    defs.extend(
        columns
            .iter()
            .map(|c| format!("{} {}", c.column.quoted(), c.physical_type.sql_name())),
    );
    defs.join(", ")
}

fn create_index_sql(table: &PhysicalIdent, index: &IndexSpec) -> String {
    format!(
        "CREATE UNIQUE INDEX {} ON {} ({}) WHERE \"_deleted_at\" IS NULL",
        index.index.quoted(),
        table.quoted(),
        index.column.quoted()
    )
}

fn run_create_index(conn: &Connection, table: &PhysicalIdent, index: &IndexSpec) -> Result<(), MigrationError> {
    conn.execute_batch(&create_index_sql(table, index))
        .map_err(|e| match StorageError::from(e) {
            StorageError::UniqueViolation { .. } => MigrationError::DuplicateValues {
                field: index.field.clone(),
            },
            other => MigrationError::from(other),
        })
}

/// UPDATE statement and parameters for one value transform
fn transform_sql(table: &PhysicalIdent, column: &PhysicalIdent, transform: &ValueTransform) -> (String, Vec<SqlValue>) {
    let t = table.quoted();
    let c = column.quoted();
    match transform {
        ValueTransform::TruncateText { max_length } => (
            format!(
                "UPDATE {t} SET {c} = substr({c}, 1, ?1) WHERE {c} IS NOT NULL AND length({c}) > ?1"
            ),
            vec![SqlValue::Integer(i64::from(*max_length))],
        ),
        ValueTransform::TruncateToInteger => (
            format!(
                "UPDATE {t} SET {c} = CAST({c} AS INTEGER) WHERE {c} IS NOT NULL AND {c} <> CAST({c} AS INTEGER)"
            ),
            Vec::new(),
        ),
        ValueTransform::DateToDatetime => (
            format!("UPDATE {t} SET {c} = {c} || 'T00:00:00.000Z' WHERE {c} IS NOT NULL AND length({c}) = 10"),
            Vec::new(),
        ),
        ValueTransform::KeepDatePart => (
            format!("UPDATE {t} SET {c} = substr({c}, 1, 10) WHERE {c} IS NOT NULL AND length({c}) > 10"),
            Vec::new(),
        ),
        ValueTransform::NullifyOutsideChoices { options } => {
            let placeholders = (1..=options.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            (
                format!("UPDATE {t} SET {c} = NULL WHERE {c} IS NOT NULL AND {c} NOT IN ({placeholders})"),
                options.iter().cloned().map(SqlValue::Text).collect(),
            )
        }
        ValueTransform::NullifyOutsideRange { min, max } => {
            let mut conditions = Vec::new();
            let mut params = Vec::new();
            if let Some(min) = min {
                params.push(SqlValue::Real(*min));
                conditions.push(format!("{c} < ?{}", params.len()));
            }
            if let Some(max) = max {
                params.push(SqlValue::Real(*max));
                conditions.push(format!("{c} > ?{}", params.len()));
            }
            if conditions.is_empty() {
                conditions.push("0".to_string());
            }
            (
                format!(
                    "UPDATE {t} SET {c} = NULL WHERE {c} IS NOT NULL AND ({})",
                    conditions.join(" OR ")
                ),
                params,
            )
        }
        ValueTransform::NullifyAll => (
            format!("UPDATE {t} SET {c} = NULL WHERE {c} IS NOT NULL"),
            Vec::new(),
        ),
    }
}

/// Executes a plan on an open transaction
pub fn execute(conn: &Connection, steps: &[StructuralOp]) -> Result<ApplyOutcome, MigrationError> {
    let mut outcome = ApplyOutcome::default();

    for step in steps {
        match step {
            StructuralOp::CreateTable { table, columns, indexes } => {
                conn.execute_batch(&format!("CREATE TABLE {} ({})", table.quoted(), column_defs(columns)))?;
                for index in indexes {
                    run_create_index(conn, table, index)?;
                }
            }
            StructuralOp::AddColumn { table, column, backfill } => {
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table.quoted(),
                    column.column.quoted(),
                    column.physical_type.sql_name()
                ))?;
                if let Some(value) = backfill {
                    conn.execute(
                        &format!("UPDATE {} SET {} = ?1", table.quoted(), column.column.quoted()),
                        [value],
                    )?;
                }
            }
            StructuralOp::RenameColumn { table, from, to } => {
                conn.execute_batch(&format!(
                    "ALTER TABLE {} RENAME COLUMN {} TO {}",
                    table.quoted(),
                    from.quoted(),
                    to.quoted()
                ))?;
            }
            StructuralOp::TransformValues {
                table,
                field,
                column,
                transform,
                overflow,
            } => {
                let (sql, params) = transform_sql(table, column, transform);
                let changed = conn.execute(&sql, params_from_iter(params.iter()))? as u64;
                if transform.is_lossy() && changed > 0 {
                    if *overflow == OverflowPolicy::Reject {
                        return Err(MigrationError::OverflowRejected {
                            field: field.clone(),
                            rows: changed,
                        });
                    }
                    outcome.lossy_rows += changed;
                }
            }
            StructuralOp::AssertEmpty { table, field } => {
                if table_has_rows(conn, table)? {
                    return Err(MigrationError::TableNotEmpty { field: field.clone() });
                }
            }
            StructuralOp::RebuildTable {
                table,
                scratch,
                columns,
                indexes,
            } => {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", scratch.quoted()))?;
                conn.execute_batch(&format!("CREATE TABLE {} ({})", scratch.quoted(), column_defs(columns)))?;
                let mut targets: Vec<String> = SYSTEM_COLUMNS.iter().map(|c| format!("\"{}\"", c)).collect();
                let mut sources = targets.clone();
                for c in columns {
                    targets.push(c.column.quoted());
                    sources.push(format!("CAST({} AS {})", c.column.quoted(), c.physical_type.sql_name()));
                }
                conn.execute_batch(&format!(
                    "INSERT INTO {} ({}) SELECT {} FROM {}",
                    scratch.quoted(),
                    targets.join(", "),
                    sources.join(", "),
                    table.quoted()
                ))?;
                conn.execute_batch(&format!("DROP TABLE {}", table.quoted()))?;
                conn.execute_batch(&format!(
                    "ALTER TABLE {} RENAME TO {}",
                    scratch.quoted(),
                    table.quoted()
                ))?;
                for index in indexes {
                    run_create_index(conn, table, index)?;
                }
            }
            StructuralOp::CreateUniqueIndex { table, index } => run_create_index(conn, table, index)?,
            StructuralOp::DropUniqueIndex { index } => {
                conn.execute_batch(&format!("DROP INDEX IF EXISTS {}", index.quoted()))?;
            }
        }
    }

    Ok(outcome)
}
