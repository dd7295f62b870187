//! Tenant Namespace Manager
//!
//! One physical namespace per project. Every table of a project is named
//! `t_<namespace>__...`, so the namespace is also a name prefix that finds
//! orphaned tables the catalog no longer knows about.
//!
//! # Invariants
//!
//! - A namespace is assigned once, in the transaction that first needs it
//! - Dropping a namespace is one transaction: every table plus every
//!   catalog row, or nothing

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::catalog::{store, Project};
use crate::identifier::{IdentifierMapper, PhysicalIdent};
use crate::observability::{log_event, Event};
use crate::storage::{CancelToken, StorageEngine, StorageError, StorageResult};

/// Allocates and destroys project namespaces
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceManager {
    mapper: IdentifierMapper,
}

impl NamespaceManager {
    pub fn new(mapper: IdentifierMapper) -> Self {
        Self { mapper }
    }

    /// Persists a new project and its namespace inside the caller's
    /// transaction. The caller has already checked the project is unknown.
    pub fn allocate(&self, conn: &Connection, project_id: &str, name: &str) -> StorageResult<Project> {
        let namespace = self
            .mapper
            .namespace(project_id)
            .map_err(|e| StorageError::Constraint(e.to_string()))?;
        let project = Project {
            project_id: project_id.to_string(),
            name: name.to_string(),
            namespace,
            created_at: Utc::now(),
        };
        store::insert_project(conn, &project)?;
        log_event(
            Event::NamespaceAllocated,
            &[
                ("project_id", project_id),
                ("namespace", project.namespace.as_str()),
            ],
        );
        Ok(project)
    }

    /// Physical tables currently carrying the namespace prefix
    pub fn physical_tables(&self, conn: &Connection, namespace: &PhysicalIdent) -> StorageResult<Vec<PhysicalIdent>> {
        let prefix = self.mapper.table_prefix(namespace);
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND substr(name, 1, ?1) = ?2 ORDER BY name",
        )?;
        let names = stmt
            .query_map(params![prefix.len() as i64, prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names
            .iter()
            .map(|name| PhysicalIdent::parse(name).map_err(|e| StorageError::Corrupt(e.to_string())))
            .collect()
    }

    /// Drops every physical table of the project and its catalog rows in
    /// one transaction. Returns the dropped table names.
    ///
    /// Only the project-deletion path of the platform reaches this.
    pub(crate) fn drop_namespace(
        &self,
        engine: &StorageEngine,
        cancel: &CancelToken,
        project: &Project,
    ) -> StorageResult<Vec<PhysicalIdent>> {
        let dropped = engine.transaction(cancel, |tx| {
            let mut targets = self.physical_tables(tx, &project.namespace)?;
            for def in store::load_tables(tx)? {
                if def.project_id == project.project_id && !targets.contains(&def.physical_name) {
                    targets.push(def.physical_name);
                }
            }
            for table in &targets {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", table.quoted()))?;
            }
            store::delete_project_rows(tx, &project.project_id)?;
            Ok(targets)
        })?;

        let count = dropped.len().to_string();
        log_event(
            Event::NamespaceDropped,
            &[
                ("project_id", project.project_id.as_str()),
                ("namespace", project.namespace.as_str()),
                ("tables", count.as_str()),
            ],
        );
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (StorageEngine, NamespaceManager, Project) {
        let engine = StorageEngine::open_in_memory().unwrap();
        let manager = NamespaceManager::default();
        let project = engine
            .transaction(&CancelToken::new(), |tx| manager.allocate(tx, "p1", "Acme"))
            .unwrap();
        (engine, manager, project)
    }

    fn create_physical(engine: &StorageEngine, manager: &NamespaceManager, project: &Project, name: &str) -> PhysicalIdent {
        let table = manager.mapper.table(&project.namespace, name).unwrap();
        engine
            .transaction(&CancelToken::new(), |tx| {
                tx.execute_batch(&format!("CREATE TABLE {} (x INTEGER)", table.quoted()))?;
                Ok(())
            })
            .unwrap();
        table
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let (_engine, manager, project) = setup();
        assert_eq!(project.namespace, manager.mapper.namespace("p1").unwrap());
    }

    #[test]
    fn test_drop_removes_orphans_and_rows() {
        let (engine, manager, project) = setup();
        let a = create_physical(&engine, &manager, &project, "clients");
        let b = create_physical(&engine, &manager, &project, "orders");

        let dropped = manager
            .drop_namespace(&engine, &CancelToken::new(), &project)
            .unwrap();
        assert_eq!(dropped.len(), 2);

        let remaining = engine.physical_tables().unwrap();
        assert!(!remaining.contains(&a.as_str().to_string()));
        assert!(!remaining.contains(&b.as_str().to_string()));
        let projects = engine.read(|conn| store::load_projects(conn)).unwrap();
        assert!(projects.is_empty());
    }

    #[test]
    fn test_drop_leaves_other_namespaces_alone() {
        let (engine, manager, project) = setup();
        let other = engine
            .transaction(&CancelToken::new(), |tx| manager.allocate(tx, "p2", "Other"))
            .unwrap();
        let kept = create_physical(&engine, &manager, &other, "clients");
        create_physical(&engine, &manager, &project, "clients");

        manager
            .drop_namespace(&engine, &CancelToken::new(), &project)
            .unwrap();
        assert!(engine.physical_tables().unwrap().contains(&kept.as_str().to_string()));
    }

    #[test]
    fn test_cancelled_drop_changes_nothing() {
        let (engine, manager, project) = setup();
        let table = create_physical(&engine, &manager, &project, "clients");
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(manager.drop_namespace(&engine, &cancel, &project).is_err());
        assert!(engine.physical_tables().unwrap().contains(&table.as_str().to_string()));
    }
}
