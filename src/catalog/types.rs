//! Catalog metadata types
//!
//! Everything here is serialized into the metadata tables as JSON, so
//! field names are part of the persisted format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifier::PhysicalIdent;
use crate::registry::{LogicalType, PhysicalType};

/// Tenant boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    /// Assigned once, never changes
    pub namespace: PhysicalIdent,
    pub created_at: DateTime<Utc>,
}

/// Table-level display metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Table behavior switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Deletes set `_deleted_at` instead of removing the row
    #[serde(default)]
    pub soft_delete: bool,
}

/// Form rendering hints for one field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

/// One declared field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,

    #[serde(flatten)]
    pub logical_type: LogicalType,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub unique: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default)]
    pub display: DisplayHints,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            required: false,
            unique: false,
            default: None,
            display: DisplayHints::default(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn physical_type(&self) -> PhysicalType {
        self.logical_type.physical_type()
    }
}

/// Whether the physical table matches the declared definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// Declared and physical schema agree
    Ready,
    /// A schema version is pending; record traffic is refused
    Migrating,
}

/// Authoritative definition of one user table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table_id: String,
    pub project_id: String,
    /// Immutable after creation
    pub logical_name: String,
    /// Deterministic function of (namespace, logical name)
    pub physical_name: PhysicalIdent,
    #[serde(default)]
    pub display: DisplayMetadata,
    #[serde(default)]
    pub options: TableOptions,
    pub fields: Vec<FieldDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last version number recorded in the log, whatever its outcome
    pub current_version: u64,
    /// Version the physical table currently reflects
    pub applied_version: u64,
    pub status: TableStatus,
}

impl TableDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_ready(&self) -> bool {
        self.status == TableStatus::Ready
    }
}

/// How a confirmed narrowing treats values that no longer fit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Rewrite values per the documented narrowing policy
    #[default]
    Coerce,
    /// Fail the migration if any value would change
    Reject,
}

/// Caller's consent to destructive changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Confirmation {
    /// No consent: narrowing and removal are rejected
    pub fn none() -> Self {
        Self::default()
    }

    /// Consent with the coercing overflow policy
    pub fn confirmed() -> Self {
        Self {
            confirmed: true,
            overflow: OverflowPolicy::Coerce,
        }
    }

    /// Consent, but abort if any stored value would change
    pub fn reject_overflow() -> Self {
        Self {
            confirmed: true,
            overflow: OverflowPolicy::Reject,
        }
    }
}

/// One field-level change requested by `alter_table`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldOp {
    Add {
        field: FieldDefinition,
    },
    Remove {
        name: String,
    },
    Rename {
        from: String,
        to: String,
    },
    ChangeType {
        name: String,
        to: LogicalType,
    },
    SetRequired {
        name: String,
        required: bool,
    },
    SetUnique {
        name: String,
        unique: bool,
    },
    SetDefault {
        name: String,
        #[serde(default)]
        default: Option<Value>,
    },
    SetDisplay {
        name: String,
        display: DisplayHints,
    },
}

impl FieldOp {
    /// Field the op targets (the source name for renames)
    pub fn target(&self) -> &str {
        match self {
            FieldOp::Add { field } => &field.name,
            FieldOp::Remove { name }
            | FieldOp::ChangeType { name, .. }
            | FieldOp::SetRequired { name, .. }
            | FieldOp::SetUnique { name, .. }
            | FieldOp::SetDefault { name, .. }
            | FieldOp::SetDisplay { name, .. } => name,
            FieldOp::Rename { from, .. } => from,
        }
    }

    /// Whether the op can only be reconciled by touching the physical table
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FieldOp::Add { .. }
                | FieldOp::Remove { .. }
                | FieldOp::Rename { .. }
                | FieldOp::ChangeType { .. }
                | FieldOp::SetUnique { .. }
        )
    }
}

/// What a schema version changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum VersionChange {
    CreateTable,
    AlterFields {
        ops: Vec<FieldOp>,
        #[serde(default)]
        confirmation: Confirmation,
    },
    UpdateDisplay {
        display: DisplayMetadata,
    },
    SetSoftDelete {
        enabled: bool,
    },
}

/// Lifecycle of a schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Pending,
    Applied,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Pending => "pending",
            VersionStatus::Applied => "applied",
            VersionStatus::Failed => "failed",
        }
    }
}

/// Append-only log entry for one schema change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub table_id: String,
    pub version: u64,
    pub change: VersionChange,
    pub status: VersionStatus,
    /// Definition as of the last applied version (none for creation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<TableDefinition>,
    /// Definition this version produces
    pub snapshot: TableDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Rows rewritten by a lossy narrowing
    #[serde(default)]
    pub lossy_rows: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Machine-readable field description for form rendering
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: &'static str,
    pub constraints: LogicalType,
    pub required: bool,
    pub unique: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub display: DisplayHints,
    pub physical_type: PhysicalType,
}

/// Machine-readable table description for collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDescriptor {
    pub table_id: String,
    pub project_id: String,
    pub name: String,
    pub display: DisplayMetadata,
    pub options: TableOptions,
    pub status: TableStatus,
    pub current_version: u64,
    pub applied_version: u64,
    pub fields: Vec<FieldDescriptor>,
}

impl From<&TableDefinition> for TableDescriptor {
    fn from(def: &TableDefinition) -> Self {
        Self {
            table_id: def.table_id.clone(),
            project_id: def.project_id.clone(),
            name: def.logical_name.clone(),
            display: def.display.clone(),
            options: def.options,
            status: def.status,
            current_version: def.current_version,
            applied_version: def.applied_version,
            fields: def
                .fields
                .iter()
                .map(|f| FieldDescriptor {
                    name: f.name.clone(),
                    type_name: f.logical_type.type_name(),
                    constraints: f.logical_type.clone(),
                    required: f.required,
                    unique: f.unique,
                    default: f.default.clone(),
                    display: f.display.clone(),
                    physical_type: f.physical_type(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_definition_json_shape() {
        let field: FieldDefinition = serde_json::from_value(json!({
            "name": "email",
            "type": "email",
            "required": true,
            "unique": true
        }))
        .unwrap();
        assert_eq!(field.logical_type, LogicalType::Email);
        assert!(field.required && field.unique);
        assert!(field.default.is_none());

        let field: FieldDefinition = serde_json::from_value(json!({
            "name": "name",
            "type": "short_text",
            "max_length": 80
        }))
        .unwrap();
        assert_eq!(field.logical_type, LogicalType::ShortText { max_length: 80 });
    }

    #[test]
    fn test_field_ops_json_shape() {
        let ops: Vec<FieldOp> = serde_json::from_value(json!([
            {"op": "add", "field": {"name": "phone", "type": "short_text"}},
            {"op": "rename", "from": "name", "to": "full_name"},
            {"op": "change_type", "name": "email", "to": {"type": "short_text", "max_length": 100}},
            {"op": "set_default", "name": "phone"}
        ]))
        .unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[1].target(), "name");
        assert!(ops[2].is_structural());
        assert!(!ops[3].is_structural());
    }

    #[test]
    fn test_confirmation_defaults_to_none() {
        let c: Confirmation = serde_json::from_value(json!({})).unwrap();
        assert_eq!(c, Confirmation::none());
        assert!(!c.confirmed);
    }
}
