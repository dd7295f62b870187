//! Schema Catalog
//!
//! Authoritative store of projects, table definitions and the schema
//! version log. Persisted in the `__tablesmith_*` metadata tables and
//! cached in memory behind one lock.
//!
//! # Invariants
//!
//! - (project, logical name) is unique; the metadata table's unique index
//!   is the final arbiter when creates race
//! - The state lock is never held across engine work. A mutation claims
//!   its table name, table or project under the lock, releases it, runs
//!   its transaction, then installs the result; a conflicting claim fails
//!   fast instead of waiting
//! - Structural versions are handed to the migrator through a queue
//! - A table with a pending version reports `Migrating` and serves no
//!   record traffic
//! - A claim is released only after the state lock is dropped

mod checks;
pub mod store;
mod types;

pub use types::{
    Confirmation, DisplayHints, DisplayMetadata, FieldDefinition, FieldDescriptor, FieldOp,
    OverflowPolicy, Project, SchemaVersion, TableDefinition, TableDescriptor, TableOptions,
    TableStatus, VersionChange, VersionStatus,
};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::errors::{ErrorKind, FieldError, ReasonCode, TablesmithError, TablesmithResult};
use crate::identifier::{IdentifierMapper, PhysicalIdent};
use crate::migration::ddl;
use crate::migration::{MigrationJob, MigrationReceiver, MigrationSender};
use crate::namespace::NamespaceManager;
use crate::observability::{log_event, Event, MetricsRegistry};
use crate::registry::FieldTypeRegistry;
use crate::storage::{table_has_rows, CancelToken, StorageEngine, StorageError};

/// Request to create a table
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewTable {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub options: TableOptions,
    #[serde(default)]
    pub display: DisplayMetadata,
}

impl NewTable {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name: name.into(),
            fields,
            options: TableOptions::default(),
            display: DisplayMetadata::default(),
        }
    }

    pub fn soft_delete(mut self) -> Self {
        self.options.soft_delete = true;
        self
    }
}

/// Metadata work in flight that excludes conflicting changes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Claim {
    /// (project, logical name) of a table being created
    Name(String, String),
    /// Table whose definition is being edited
    Table(String),
    /// Project being deleted
    Project(String),
}

/// Releases its claim on drop. Must outlive any state guard taken in the
/// same scope.
struct ClaimGuard<'a> {
    lock: &'a RwLock<CatalogState>,
    claim: Claim,
}

impl<'a> ClaimGuard<'a> {
    fn take(lock: &'a RwLock<CatalogState>, state: &mut CatalogState, claim: Claim) -> Self {
        state.claims.insert(claim.clone());
        Self { lock, claim }
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        state.claims.remove(&self.claim);
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    projects: HashMap<String, Project>,
    tables: HashMap<String, TableDefinition>,
    by_name: HashMap<(String, String), String>,
    claims: HashSet<Claim>,
}

impl CatalogState {
    fn insert_table(&mut self, def: TableDefinition) {
        self.by_name.insert(
            (def.project_id.clone(), def.logical_name.clone()),
            def.table_id.clone(),
        );
        self.tables.insert(def.table_id.clone(), def);
    }

    fn table(&self, table_id: &str) -> TablesmithResult<&TableDefinition> {
        self.tables
            .get(table_id)
            .ok_or_else(|| TablesmithError::not_found(format!("table '{}' does not exist", table_id)))
    }

    fn project_deleting(&self, project_id: &str) -> bool {
        self.claims.contains(&Claim::Project(project_id.to_string()))
    }

    /// A table accepts a new version only when no migration, edit or
    /// project deletion touches it
    fn check_editable(&self, def: &TableDefinition) -> TablesmithResult<()> {
        if !def.is_ready()
            || self.claims.contains(&Claim::Table(def.table_id.clone()))
            || self.project_deleting(&def.project_id)
        {
            return Err(TablesmithError::schema_not_ready(def.logical_name.clone()));
        }
        Ok(())
    }
}

fn project_deleting(project_id: &str) -> TablesmithError {
    TablesmithError::conflict(format!("project '{}' is being deleted", project_id))
}

/// In-memory view of the catalog backed by the metadata tables
pub struct Catalog {
    engine: StorageEngine,
    registry: Arc<FieldTypeRegistry>,
    mapper: IdentifierMapper,
    namespaces: NamespaceManager,
    metrics: Arc<MetricsRegistry>,
    state: RwLock<CatalogState>,
    jobs: MigrationSender,
    changes: watch::Sender<u64>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").field("engine", &self.engine).finish()
    }
}

fn poisoned() -> TablesmithError {
    TablesmithError::internal("catalog lock poisoned")
}

impl Catalog {
    /// Loads the catalog and queues versions a crash left pending.
    ///
    /// The returned receiver feeds the migrator.
    pub fn open(
        engine: StorageEngine,
        registry: Arc<FieldTypeRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> TablesmithResult<(Self, MigrationReceiver)> {
        let mapper = IdentifierMapper::new();
        let (projects, tables, pending) = engine.read(|conn| {
            Ok((
                store::load_projects(conn)?,
                store::load_tables(conn)?,
                store::load_pending_versions(conn)?,
            ))
        })?;

        let mut state = CatalogState::default();
        for project in projects {
            state.projects.insert(project.project_id.clone(), project);
        }
        for def in tables {
            state.insert_table(def);
        }
        let table_count = state.tables.len().to_string();
        let project_count = state.projects.len().to_string();

        let (jobs, receiver) = mpsc::unbounded_channel();
        let (changes, _) = watch::channel(0);
        let catalog = Self {
            engine,
            registry,
            mapper,
            namespaces: NamespaceManager::new(mapper),
            metrics,
            state: RwLock::new(state),
            jobs,
            changes,
        };

        log_event(
            Event::CatalogLoaded,
            &[
                ("projects", project_count.as_str()),
                ("tables", table_count.as_str()),
            ],
        );

        for entry in pending {
            let version = entry.version.to_string();
            log_event(
                Event::MigrationRecovered,
                &[
                    ("table_id", entry.table_id.as_str()),
                    ("version", version.as_str()),
                ],
            );
            catalog.enqueue(entry);
        }

        Ok((catalog, receiver))
    }

    fn read_state(&self) -> TablesmithResult<RwLockReadGuard<'_, CatalogState>> {
        self.state.read().map_err(|_| poisoned())
    }

    fn write_state(&self) -> TablesmithResult<RwLockWriteGuard<'_, CatalogState>> {
        self.state.write().map_err(|_| poisoned())
    }

    fn enqueue(&self, entry: SchemaVersion) {
        let table_id = entry.table_id.clone();
        let version = entry.version.to_string();
        if self.jobs.send(MigrationJob { entry }).is_err() {
            // Migrator gone (shutdown); the version stays pending and is
            // recovered on the next start.
            log_event(
                Event::MigrationFailed,
                &[
                    ("table_id", table_id.as_str()),
                    ("version", version.as_str()),
                    ("reason", "migration queue closed"),
                ],
            );
            return;
        }
        log_event(
            Event::MigrationEnqueued,
            &[("table_id", table_id.as_str()), ("version", version.as_str())],
        );
    }

    /// Watch channel bumped whenever a migration reaches a terminal state
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    // ---- projects ----

    /// Registers a project, allocating its namespace. Idempotent.
    pub fn register_project(
        &self,
        cancel: &CancelToken,
        project_id: &str,
        name: &str,
    ) -> TablesmithResult<Project> {
        {
            let state = self.read_state()?;
            if let Some(existing) = state.projects.get(project_id) {
                return Ok(existing.clone());
            }
            if state.project_deleting(project_id) {
                return Err(project_deleting(project_id));
            }
        }
        let project = self.engine.transaction(cancel, |tx| {
            match store::find_project(tx, project_id)? {
                Some(existing) => Ok(existing),
                None => self.namespaces.allocate(tx, project_id, name),
            }
        })?;
        let mut state = self.write_state()?;
        Ok(state
            .projects
            .entry(project_id.to_string())
            .or_insert(project)
            .clone())
    }

    pub fn get_project(&self, project_id: &str) -> TablesmithResult<Project> {
        self.read_state()?
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| TablesmithError::not_found(format!("project '{}' does not exist", project_id)))
    }

    /// Drops the project's namespace and forgets it. Refuses while any of
    /// its tables is migrating, being edited or being created.
    pub(crate) fn drop_project(
        &self,
        cancel: &CancelToken,
        project_id: &str,
    ) -> TablesmithResult<Vec<PhysicalIdent>> {
        let (project, claim) = {
            let mut state = self.write_state()?;
            let project = state
                .projects
                .get(project_id)
                .cloned()
                .ok_or_else(|| TablesmithError::not_found(format!("project '{}' does not exist", project_id)))?;
            if state.project_deleting(project_id) {
                return Err(project_deleting(project_id));
            }
            for def in state.tables.values().filter(|t| t.project_id == project_id) {
                state.check_editable(def)?;
            }
            let creating = state.claims.iter().find_map(|claim| match claim {
                Claim::Name(project, name) if project == project_id => Some(name.clone()),
                _ => None,
            });
            if let Some(name) = creating {
                return Err(TablesmithError::schema_not_ready(name));
            }
            let claim = ClaimGuard::take(&self.state, &mut state, Claim::Project(project_id.to_string()));
            (project, claim)
        };

        let dropped = self.namespaces.drop_namespace(&self.engine, cancel, &project)?;

        {
            let mut state = self.write_state()?;
            state.projects.remove(project_id);
            state.tables.retain(|_, t| t.project_id != project_id);
            state.by_name.retain(|(p, _), _| p != project_id);
        }
        drop(claim);
        Ok(dropped)
    }

    // ---- tables ----

    /// Creates a table and its physical storage in one transaction.
    ///
    /// The name is claimed under the state lock; the DDL runs after the
    /// lock is released.
    pub fn create_table(
        &self,
        cancel: &CancelToken,
        project_id: &str,
        request: NewTable,
    ) -> TablesmithResult<TableDefinition> {
        if let Err(e) = crate::identifier::check_logical_name(&request.name) {
            return Err(checks::into_error(vec![checks::name_error(&request.name, e)]));
        }
        let errors = checks::check_fields(&self.registry, &request.fields);
        if !errors.is_empty() {
            return Err(checks::into_error(errors).with_table(request.name.clone()));
        }

        let key = (project_id.to_string(), request.name.clone());
        let claim = {
            let mut state = self.write_state()?;
            if state.project_deleting(project_id) {
                return Err(project_deleting(project_id));
            }
            let name_claim = Claim::Name(key.0.clone(), key.1.clone());
            if state.by_name.contains_key(&key) || state.claims.contains(&name_claim) {
                return Err(duplicate_table(&request.name));
            }
            ClaimGuard::take(&self.state, &mut state, name_claim)
        };

        let now = Utc::now();
        let name = request.name.clone();
        let (project, def) = self
            .engine
            .try_transaction(cancel, |tx| -> TablesmithResult<(Project, TableDefinition)> {
                let project = match store::find_project(tx, project_id)? {
                    Some(project) => project,
                    None => self.namespaces.allocate(tx, project_id, project_id)?,
                };
                let physical_name = self
                    .mapper
                    .table(&project.namespace, &request.name)
                    .map_err(|e| checks::into_error(vec![checks::name_error(&request.name, e)]))?;
                let def = TableDefinition {
                    table_id: Uuid::new_v4().to_string(),
                    project_id: project_id.to_string(),
                    logical_name: request.name.clone(),
                    physical_name,
                    display: request.display,
                    options: request.options,
                    fields: request.fields,
                    created_at: now,
                    updated_at: now,
                    current_version: 1,
                    applied_version: 1,
                    status: TableStatus::Ready,
                };
                ddl::plan_create(&self.mapper, &def)
                    .and_then(|steps| ddl::execute(tx, &steps))
                    .map_err(|e| {
                        TablesmithError::internal(format!("cannot create table storage: {}", e))
                    })?;
                store::insert_table(tx, &def).map_err(|e| match e {
                    StorageError::UniqueViolation { .. } => duplicate_table(&def.logical_name),
                    other => other.into(),
                })?;
                store::insert_version(
                    tx,
                    &SchemaVersion {
                        table_id: def.table_id.clone(),
                        version: 1,
                        change: VersionChange::CreateTable,
                        status: VersionStatus::Applied,
                        previous: None,
                        snapshot: def.clone(),
                        error: None,
                        lossy_rows: 0,
                        created_at: now,
                        completed_at: Some(now),
                    },
                )?;
                Ok((project, def))
            })
            .map_err(|e| e.with_table(name.clone()))?;

        {
            let mut state = self.write_state()?;
            state.projects.entry(project_id.to_string()).or_insert(project);
            state.insert_table(def.clone());
        }
        drop(claim);

        self.metrics.increment_tables_created();
        self.metrics.increment_schema_versions();
        log_event(
            Event::TableCreated,
            &[
                ("project_id", project_id),
                ("table", def.logical_name.as_str()),
                ("table_id", def.table_id.as_str()),
                ("physical", def.physical_name.as_str()),
            ],
        );
        Ok(def)
    }

    /// Records a new schema version with every field op applied, or none.
    ///
    /// Structural versions are queued for the migrator and the table
    /// reports `Migrating` until they complete; the others apply inline.
    pub fn alter_table(
        &self,
        cancel: &CancelToken,
        table_id: &str,
        ops: Vec<FieldOp>,
        confirmation: Confirmation,
    ) -> TablesmithResult<SchemaVersion> {
        let (current, claim) = self.claim_table(table_id)?;
        if ops.is_empty() {
            return Err(TablesmithError::new(
                ErrorKind::ValidationError,
                "alter_table needs at least one field op",
            )
            .with_table(current.logical_name.clone()));
        }

        let applied = checks::apply_ops(&self.registry, &current.fields, &ops)
            .map_err(|errors| checks::into_error(errors).with_table(current.logical_name.clone()))?;

        if !applied.destructive.is_empty() && !confirmation.confirmed {
            return Err(TablesmithError::destructive_change(format!(
                "removing or narrowing [{}] can lose data; confirmation required",
                applied.destructive.join(", ")
            ))
            .with_table(current.logical_name.clone()));
        }
        if !applied.incompatible.is_empty() {
            let has_rows = self
                .engine
                .snapshot(cancel, |conn| table_has_rows(conn, &current.physical_name))?;
            if has_rows {
                let errors = applied
                    .incompatible
                    .iter()
                    .map(|f| {
                        FieldError::new(
                            f,
                            ReasonCode::IncompatibleTypeChange,
                            format!("field '{}' has no conversion path while records exist", f),
                        )
                    })
                    .collect();
                return Err(TablesmithError::validation(errors).with_table(current.logical_name.clone()));
            }
        }

        let structural = ops.iter().any(FieldOp::is_structural);
        let version = current.current_version + 1;
        let now = Utc::now();

        let mut snapshot = current.clone();
        snapshot.fields = applied.fields;
        snapshot.current_version = version;
        snapshot.applied_version = version;
        snapshot.updated_at = now;
        snapshot.status = TableStatus::Ready;

        let stored = if structural {
            let mut stored = snapshot.clone();
            stored.applied_version = current.applied_version;
            stored.status = TableStatus::Migrating;
            stored
        } else {
            snapshot.clone()
        };

        let entry = SchemaVersion {
            table_id: table_id.to_string(),
            version,
            change: VersionChange::AlterFields { ops, confirmation },
            status: if structural {
                VersionStatus::Pending
            } else {
                VersionStatus::Applied
            },
            previous: Some(current.clone()),
            snapshot,
            error: None,
            lossy_rows: 0,
            created_at: now,
            completed_at: if structural { None } else { Some(now) },
        };

        self.engine.transaction(cancel, |tx| {
            store::update_table(tx, &stored)?;
            store::insert_version(tx, &entry)
        })?;
        self.write_state()?.insert_table(stored);
        drop(claim);

        self.metrics.increment_schema_versions();
        let version_str = version.to_string();
        log_event(
            Event::TableAltered,
            &[
                ("table", current.logical_name.as_str()),
                ("table_id", table_id),
                ("version", version_str.as_str()),
                ("structural", if structural { "true" } else { "false" }),
            ],
        );
        if structural {
            self.enqueue(entry.clone());
        } else {
            self.changes.send_modify(|generation| *generation += 1);
        }
        Ok(entry)
    }

    /// Claims a ready table for one metadata edit
    fn claim_table(&self, table_id: &str) -> TablesmithResult<(TableDefinition, ClaimGuard<'_>)> {
        let mut state = self.write_state()?;
        let current = state.table(table_id)?.clone();
        state.check_editable(&current)?;
        let claim = ClaimGuard::take(&self.state, &mut state, Claim::Table(table_id.to_string()));
        Ok((current, claim))
    }

    /// Records a non-structural version that edits the table itself
    fn record_table_edit(
        &self,
        cancel: &CancelToken,
        table_id: &str,
        change: VersionChange,
        edit: impl FnOnce(&mut TableDefinition),
    ) -> TablesmithResult<TableDefinition> {
        let (current, claim) = self.claim_table(table_id)?;
        let now = Utc::now();
        let mut updated = current.clone();
        edit(&mut updated);
        updated.current_version += 1;
        updated.applied_version = updated.current_version;
        updated.updated_at = now;

        let entry = SchemaVersion {
            table_id: table_id.to_string(),
            version: updated.current_version,
            change,
            status: VersionStatus::Applied,
            previous: Some(current),
            snapshot: updated.clone(),
            error: None,
            lossy_rows: 0,
            created_at: now,
            completed_at: Some(now),
        };
        self.engine.transaction(cancel, |tx| {
            store::update_table(tx, &updated)?;
            store::insert_version(tx, &entry)
        })?;
        self.write_state()?.insert_table(updated.clone());
        drop(claim);

        self.metrics.increment_schema_versions();
        log_event(
            Event::TableMetadataUpdated,
            &[
                ("table", updated.logical_name.as_str()),
                ("table_id", table_id),
            ],
        );
        Ok(updated)
    }

    /// Edits the display label and description. The logical name and the
    /// physical identifier never change.
    pub fn update_display(
        &self,
        cancel: &CancelToken,
        table_id: &str,
        display: DisplayMetadata,
    ) -> TablesmithResult<TableDefinition> {
        let change = VersionChange::UpdateDisplay {
            display: display.clone(),
        };
        self.record_table_edit(cancel, table_id, change, |def| def.display = display)
    }

    pub fn set_soft_delete(
        &self,
        cancel: &CancelToken,
        table_id: &str,
        enabled: bool,
    ) -> TablesmithResult<TableDefinition> {
        let change = VersionChange::SetSoftDelete { enabled };
        self.record_table_edit(cancel, table_id, change, |def| {
            def.options.soft_delete = enabled
        })
    }

    pub fn get_table(&self, project_id: &str, name: &str) -> TablesmithResult<TableDefinition> {
        let state = self.read_state()?;
        state
            .by_name
            .get(&(project_id.to_string(), name.to_string()))
            .and_then(|id| state.tables.get(id))
            .cloned()
            .ok_or_else(|| {
                TablesmithError::not_found(format!("table '{}' does not exist", name)).with_table(name)
            })
    }

    pub fn get_table_by_id(&self, table_id: &str) -> TablesmithResult<TableDefinition> {
        self.read_state()?.table(table_id).cloned()
    }

    /// Tables of a project, ordered by logical name
    pub fn list_tables(&self, project_id: &str) -> TablesmithResult<Vec<TableDefinition>> {
        let state = self.read_state()?;
        let mut tables: Vec<TableDefinition> = state
            .tables
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tables.sort_by(|a, b| a.logical_name.cmp(&b.logical_name));
        Ok(tables)
    }

    /// Version log of a table, oldest first
    pub fn schema_versions(&self, table_id: &str) -> TablesmithResult<Vec<SchemaVersion>> {
        self.read_state()?.table(table_id)?;
        Ok(self.engine.read(|conn| store::load_versions(conn, table_id))?)
    }

    /// Status of one version. A version stays `Pending` until the in-memory
    /// definition has caught up with its outcome.
    pub fn version_status(&self, table_id: &str, version: u64) -> TablesmithResult<Option<VersionStatus>> {
        {
            let state = self.read_state()?;
            let def = state.table(table_id)?;
            if !def.is_ready() && def.current_version == version {
                return Ok(Some(VersionStatus::Pending));
            }
        }
        Ok(self
            .engine
            .read(|conn| store::version_status(conn, table_id, version))?)
    }

    /// Installs the definition the migrator committed for a finished
    /// version, applied or reverted.
    pub(crate) fn finish_migration(&self, definition: TableDefinition) -> TablesmithResult<()> {
        let mut state = self.write_state()?;
        if state.tables.contains_key(&definition.table_id) {
            state.insert_table(definition);
        }
        drop(state);
        self.changes.send_modify(|generation| *generation += 1);
        Ok(())
    }
}

fn duplicate_table(name: &str) -> TablesmithError {
    TablesmithError::conflict(format!("table '{}' already exists in this project", name)).with_table(name)
}
