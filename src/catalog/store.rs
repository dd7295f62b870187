//! Catalog persistence
//!
//! Rows of the `__tablesmith_*` metadata tables. Definitions and version
//! entries are stored as JSON documents next to the columns that carry
//! the uniqueness constraints (project id, logical name, physical name).
//!
//! Every function takes a plain `Connection`; callers pass a
//! `Transaction` (which derefs to one) when the write must be atomic with
//! other work.

use rusqlite::{params, Connection, OptionalExtension};

use super::types::{Project, SchemaVersion, TableDefinition, VersionStatus};
use crate::identifier::PhysicalIdent;
use crate::storage::{StorageError, StorageResult};

pub fn insert_project(conn: &Connection, project: &Project) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO __tablesmith_projects (project_id, name, namespace, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            project.project_id,
            project.name,
            project.namespace.as_str(),
            project.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn load_projects(conn: &Connection) -> StorageResult<Vec<Project>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, name, namespace, created_at FROM __tablesmith_projects ORDER BY project_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(project_id, name, namespace, created_at)| {
            let namespace = PhysicalIdent::parse(&namespace)
                .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StorageError::Corrupt(e.to_string()))?
                .with_timezone(&chrono::Utc);
            Ok(Project {
                project_id,
                name,
                namespace,
                created_at,
            })
        })
        .collect()
}

/// The registered project, if any
pub fn find_project(conn: &Connection, project_id: &str) -> StorageResult<Option<Project>> {
    Ok(load_projects(conn)?
        .into_iter()
        .find(|p| p.project_id == project_id))
}

pub fn insert_table(conn: &Connection, def: &TableDefinition) -> StorageResult<()> {
    let document = serde_json::to_string(def)?;
    conn.execute(
        "INSERT INTO __tablesmith_tables (table_id, project_id, logical_name, physical_name, definition)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            def.table_id,
            def.project_id,
            def.logical_name,
            def.physical_name.as_str(),
            document,
        ],
    )?;
    Ok(())
}

pub fn update_table(conn: &Connection, def: &TableDefinition) -> StorageResult<()> {
    let document = serde_json::to_string(def)?;
    let changed = conn.execute(
        "UPDATE __tablesmith_tables SET definition = ?2 WHERE table_id = ?1",
        params![def.table_id, document],
    )?;
    if changed == 0 {
        return Err(StorageError::Corrupt(format!(
            "table {} missing from catalog",
            def.table_id
        )));
    }
    Ok(())
}

pub fn load_tables(conn: &Connection) -> StorageResult<Vec<TableDefinition>> {
    let mut stmt = conn.prepare("SELECT definition FROM __tablesmith_tables ORDER BY table_id")?;
    let documents = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    documents
        .iter()
        .map(|doc| serde_json::from_str(doc).map_err(StorageError::from))
        .collect()
}

pub fn insert_version(conn: &Connection, entry: &SchemaVersion) -> StorageResult<()> {
    let document = serde_json::to_string(entry)?;
    conn.execute(
        "INSERT INTO __tablesmith_versions (table_id, version, status, entry) VALUES (?1, ?2, ?3, ?4)",
        params![
            entry.table_id,
            entry.version as i64,
            entry.status.as_str(),
            document
        ],
    )?;
    Ok(())
}

pub fn update_version(conn: &Connection, entry: &SchemaVersion) -> StorageResult<()> {
    let document = serde_json::to_string(entry)?;
    conn.execute(
        "UPDATE __tablesmith_versions SET status = ?3, entry = ?4 WHERE table_id = ?1 AND version = ?2",
        params![
            entry.table_id,
            entry.version as i64,
            entry.status.as_str(),
            document
        ],
    )?;
    Ok(())
}

pub fn load_versions(conn: &Connection, table_id: &str) -> StorageResult<Vec<SchemaVersion>> {
    let mut stmt = conn.prepare(
        "SELECT entry FROM __tablesmith_versions WHERE table_id = ?1 ORDER BY version",
    )?;
    let documents = stmt
        .query_map(params![table_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    decode_versions(&documents)
}

/// Versions a crash left pending, oldest first
pub fn load_pending_versions(conn: &Connection) -> StorageResult<Vec<SchemaVersion>> {
    let mut stmt = conn.prepare(
        "SELECT entry FROM __tablesmith_versions WHERE status = 'pending' ORDER BY table_id, version",
    )?;
    let documents = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    decode_versions(&documents)
}

pub fn version_status(
    conn: &Connection,
    table_id: &str,
    version: u64,
) -> StorageResult<Option<VersionStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM __tablesmith_versions WHERE table_id = ?1 AND version = ?2",
            params![table_id, version as i64],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref() {
        None => Ok(None),
        Some("pending") => Ok(Some(VersionStatus::Pending)),
        Some("applied") => Ok(Some(VersionStatus::Applied)),
        Some("failed") => Ok(Some(VersionStatus::Failed)),
        Some(other) => Err(StorageError::Corrupt(format!(
            "unknown version status '{}'",
            other
        ))),
    }
}

/// State record traffic checks its definition against, inside its own
/// transaction: `None` once the table is gone, otherwise whether a version
/// is pending and the newest applied version.
pub fn applied_fence(conn: &Connection, table_id: &str) -> StorageResult<Option<(bool, u64)>> {
    let fence: Option<(bool, i64)> = conn
        .query_row(
            "SELECT
                EXISTS (SELECT 1 FROM __tablesmith_versions WHERE table_id = ?1 AND status = 'pending'),
                COALESCE((SELECT MAX(version) FROM __tablesmith_versions
                          WHERE table_id = ?1 AND status = 'applied'), 0)
             FROM __tablesmith_tables WHERE table_id = ?1",
            params![table_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(fence.map(|(pending, applied)| (pending, applied as u64)))
}

/// Deletes every catalog row of a project
pub fn delete_project_rows(conn: &Connection, project_id: &str) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM __tablesmith_versions WHERE table_id IN
         (SELECT table_id FROM __tablesmith_tables WHERE project_id = ?1)",
        params![project_id],
    )?;
    conn.execute(
        "DELETE FROM __tablesmith_tables WHERE project_id = ?1",
        params![project_id],
    )?;
    conn.execute(
        "DELETE FROM __tablesmith_projects WHERE project_id = ?1",
        params![project_id],
    )?;
    Ok(())
}

fn decode_versions(documents: &[String]) -> StorageResult<Vec<SchemaVersion>> {
    documents
        .iter()
        .map(|doc| serde_json::from_str(doc).map_err(StorageError::from))
        .collect()
}
