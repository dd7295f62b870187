//! Platform facade
//!
//! Wires storage, catalog, migrator and CRUD engine together and exposes
//! the collaborator-facing API. Every call resolves its caller and is
//! checked by the access guard before the catalog is touched. Successful
//! mutations are reported to the analytics sink on a best-effort basis.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::access::{AccessGuard, Action, CallerIdentity, IdentityProvider};
use crate::catalog::{
    Catalog, Confirmation, DisplayMetadata, FieldOp, NewTable, Project, SchemaVersion, TableDefinition,
    TableDescriptor, VersionStatus,
};
use crate::config::PlatformConfig;
use crate::crud::{CrudEngine, CrudSettings, DeleteResponse, ListQuery, ListResponse, Record};
use crate::errors::{ErrorKind, TablesmithError, TablesmithResult};
use crate::migration::{MigrationReport, Migrator};
use crate::observability::{
    emit_best_effort, log_event, AnalyticsEvent, AnalyticsSink, Event, MetricsRegistry, MetricsSnapshot,
    OperationKind,
};
use crate::registry::FieldTypeRegistry;
use crate::storage::{run_blocking, CancelToken, StorageEngine};

/// Result of an explicit project deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectDeletion {
    pub project_id: String,
    pub tables_dropped: usize,
}

/// One running tablesmith instance
pub struct Platform {
    config: PlatformConfig,
    catalog: Arc<Catalog>,
    migrator: Arc<Migrator>,
    crud: CrudEngine,
    guard: AccessGuard,
    identity: Arc<dyn IdentityProvider>,
    analytics: Arc<dyn AnalyticsSink>,
    metrics: Arc<MetricsRegistry>,
    dispatch: JoinHandle<()>,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("database", &self.config.database_path)
            .finish()
    }
}

impl Platform {
    /// Opens the database, loads the catalog and starts the migrator.
    ///
    /// Versions left pending by a previous run are re-queued.
    pub async fn open(
        config: PlatformConfig,
        identity: Arc<dyn IdentityProvider>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> TablesmithResult<Self> {
        config
            .validate()
            .map_err(|e| TablesmithError::new(ErrorKind::ValidationError, e.to_string()))?;

        let engine = if config.is_in_memory() {
            StorageEngine::open_in_memory()?
        } else {
            StorageEngine::open(
                Path::new(&config.database_path),
                config.busy_timeout(),
                config.read_pool_size,
            )?
        };

        let registry = Arc::new(FieldTypeRegistry::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let (catalog, jobs) = Catalog::open(engine.clone(), Arc::clone(&registry), Arc::clone(&metrics))?;
        let catalog = Arc::new(catalog);

        let migrator = Arc::new(Migrator::new(
            engine.clone(),
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.migration_timeout(),
        ));
        let dispatch = migrator.spawn(jobs);

        let crud = CrudEngine::new(
            engine,
            Arc::clone(&catalog),
            registry,
            Arc::clone(&metrics),
            CrudSettings::from(&config),
        );

        log_event(Event::PlatformReady, &[("database", config.database_path.as_str())]);
        Ok(Self {
            guard: AccessGuard::new(Arc::clone(&metrics)),
            config,
            catalog,
            migrator,
            crud,
            identity,
            analytics,
            metrics,
            dispatch,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Reports of every version reaching a terminal state
    pub fn subscribe_migrations(&self) -> broadcast::Receiver<MigrationReport> {
        self.migrator.subscribe()
    }

    fn authorize(&self, token: &str, project_id: &str, action: Action) -> TablesmithResult<CallerIdentity> {
        let caller = self.identity.resolve(token)?;
        self.guard.authorize(&caller, project_id, action)?;
        Ok(caller)
    }

    fn emit(&self, project_id: &str, table_id: Option<&str>, operation: OperationKind) {
        emit_best_effort(
            self.analytics.as_ref(),
            AnalyticsEvent::new(project_id, table_id.map(str::to_string), operation),
        );
    }

    /// Runs a catalog operation on the blocking pool under the CRUD deadline
    async fn catalog_op<T, F>(&self, operation: &'static str, f: F) -> TablesmithResult<T>
    where
        F: FnOnce(&Catalog, &CancelToken) -> TablesmithResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let catalog = Arc::clone(&self.catalog);
        let result = run_blocking(operation, self.config.crud_timeout(), move |cancel| {
            f(&catalog, &cancel)
        })
        .await;
        if matches!(&result, Err(e) if e.kind() == ErrorKind::Timeout) {
            self.metrics.increment_timeouts();
        }
        result
    }

    fn table(&self, project_id: &str, table: &str) -> TablesmithResult<TableDefinition> {
        self.catalog.get_table(project_id, table)
    }

    // ---- projects ----

    /// Registers a project ahead of its first table
    pub async fn register_project(&self, token: &str, project_id: &str, name: &str) -> TablesmithResult<Project> {
        self.authorize(token, project_id, Action::ManageProject)?;
        let (project_id, name) = (project_id.to_string(), name.to_string());
        self.catalog_op("register project", move |catalog, cancel| {
            catalog.register_project(cancel, &project_id, &name)
        })
        .await
    }

    pub fn get_project(&self, token: &str, project_id: &str) -> TablesmithResult<Project> {
        self.authorize(token, project_id, Action::Read)?;
        self.catalog.get_project(project_id)
    }

    /// Drops every table of the project in one transaction. Requires the
    /// owner role and explicit confirmation.
    pub async fn delete_project(&self, token: &str, project_id: &str, confirmed: bool) -> TablesmithResult<ProjectDeletion> {
        self.authorize(token, project_id, Action::ManageProject)?;
        if !confirmed {
            return Err(TablesmithError::destructive_change(format!(
                "deleting project '{}' drops every table and record; confirmation required",
                project_id
            )));
        }
        let id = project_id.to_string();
        let dropped = self
            .catalog_op("delete project", move |catalog, cancel| catalog.drop_project(cancel, &id))
            .await?;
        self.emit(project_id, None, OperationKind::ProjectDeleted);
        Ok(ProjectDeletion {
            project_id: project_id.to_string(),
            tables_dropped: dropped.len(),
        })
    }

    // ---- schema authoring ----

    pub async fn create_table(&self, token: &str, project_id: &str, request: NewTable) -> TablesmithResult<TableDescriptor> {
        self.authorize(token, project_id, Action::AuthorSchema)?;
        let project = project_id.to_string();
        let def = self
            .catalog_op("create table", move |catalog, cancel| {
                catalog.create_table(cancel, &project, request)
            })
            .await?;
        self.emit(project_id, Some(&def.table_id), OperationKind::TableCreated);
        Ok(TableDescriptor::from(&def))
    }

    /// Records a schema version. Structural versions complete
    /// asynchronously; see `wait_for_version` and `subscribe_migrations`.
    pub async fn alter_table(
        &self,
        token: &str,
        project_id: &str,
        table: &str,
        ops: Vec<FieldOp>,
        confirmation: Confirmation,
    ) -> TablesmithResult<SchemaVersion> {
        self.authorize(token, project_id, Action::AuthorSchema)?;
        let table_id = self.table(project_id, table)?.table_id;
        let id = table_id.clone();
        let entry = self
            .catalog_op("alter table", move |catalog, cancel| {
                catalog.alter_table(cancel, &id, ops, confirmation)
            })
            .await?;
        self.emit(project_id, Some(&table_id), OperationKind::TableAltered);
        Ok(entry)
    }

    /// Edits the table label and description
    pub async fn update_table_display(
        &self,
        token: &str,
        project_id: &str,
        table: &str,
        display: DisplayMetadata,
    ) -> TablesmithResult<TableDescriptor> {
        self.authorize(token, project_id, Action::AuthorSchema)?;
        let table_id = self.table(project_id, table)?.table_id;
        let def = self
            .catalog_op("update table display", move |catalog, cancel| {
                catalog.update_display(cancel, &table_id, display)
            })
            .await?;
        self.emit(project_id, Some(&def.table_id), OperationKind::TableAltered);
        Ok(TableDescriptor::from(&def))
    }

    pub async fn set_soft_delete(
        &self,
        token: &str,
        project_id: &str,
        table: &str,
        enabled: bool,
    ) -> TablesmithResult<TableDescriptor> {
        self.authorize(token, project_id, Action::AuthorSchema)?;
        let table_id = self.table(project_id, table)?.table_id;
        let def = self
            .catalog_op("set soft delete", move |catalog, cancel| {
                catalog.set_soft_delete(cancel, &table_id, enabled)
            })
            .await?;
        self.emit(project_id, Some(&def.table_id), OperationKind::TableAltered);
        Ok(TableDescriptor::from(&def))
    }

    pub fn get_table(&self, token: &str, project_id: &str, table: &str) -> TablesmithResult<TableDescriptor> {
        self.authorize(token, project_id, Action::Read)?;
        Ok(TableDescriptor::from(&self.table(project_id, table)?))
    }

    pub fn list_tables(&self, token: &str, project_id: &str) -> TablesmithResult<Vec<TableDescriptor>> {
        self.authorize(token, project_id, Action::Read)?;
        Ok(self
            .catalog
            .list_tables(project_id)?
            .iter()
            .map(TableDescriptor::from)
            .collect())
    }

    /// Version log of a table, oldest first
    pub fn schema_versions(&self, token: &str, project_id: &str, table: &str) -> TablesmithResult<Vec<SchemaVersion>> {
        self.authorize(token, project_id, Action::Read)?;
        let table_id = self.table(project_id, table)?.table_id;
        self.catalog.schema_versions(&table_id)
    }

    /// Waits until `version` of the table is applied.
    ///
    /// A failed version is returned as `MigrationFailed` carrying the
    /// recorded reason; a version still pending at the deadline as
    /// `Timeout`. A table id from another project reads as missing.
    pub async fn wait_for_version(
        &self,
        token: &str,
        project_id: &str,
        table_id: &str,
        version: u64,
        timeout: Duration,
    ) -> TablesmithResult<VersionStatus> {
        self.authorize(token, project_id, Action::Read)?;
        match self.catalog.get_table_by_id(table_id) {
            Ok(def) if def.project_id == project_id => {}
            _ => {
                return Err(TablesmithError::not_found(format!(
                    "table '{}' does not exist",
                    table_id
                )))
            }
        }
        let mut changes = self.catalog.subscribe_changes();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.catalog.version_status(table_id, version)? {
                None => {
                    return Err(TablesmithError::not_found(format!(
                        "version {} of table '{}' does not exist",
                        version, table_id
                    )))
                }
                Some(VersionStatus::Applied) => return Ok(VersionStatus::Applied),
                Some(VersionStatus::Failed) => return Err(self.failure_of(table_id, version)),
                Some(VersionStatus::Pending) => {}
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(TablesmithError::internal("catalog change feed closed")),
                Err(_) => {
                    self.metrics.increment_timeouts();
                    return Err(TablesmithError::timeout("wait_for_version"));
                }
            }
        }
    }

    fn failure_of(&self, table_id: &str, version: u64) -> TablesmithError {
        let reason = self
            .catalog
            .schema_versions(table_id)
            .ok()
            .and_then(|log| log.into_iter().find(|v| v.version == version))
            .and_then(|v| v.error)
            .unwrap_or_else(|| "migration failed".to_string());
        let error = TablesmithError::migration_failed(reason);
        match self.catalog.get_table_by_id(table_id) {
            Ok(def) => error.with_table(def.logical_name),
            Err(_) => error,
        }
    }

    // ---- records ----

    pub async fn list_records(
        &self,
        token: &str,
        project_id: &str,
        table: &str,
        query: ListQuery,
    ) -> TablesmithResult<ListResponse<Record>> {
        self.authorize(token, project_id, Action::Read)?;
        self.crud.list(project_id, table, query).await
    }

    pub async fn get_record(&self, token: &str, project_id: &str, table: &str, id: &str) -> TablesmithResult<Record> {
        self.authorize(token, project_id, Action::Read)?;
        self.crud.get(project_id, table, id).await
    }

    pub async fn create_record(&self, token: &str, project_id: &str, table: &str, record: Value) -> TablesmithResult<Record> {
        self.authorize(token, project_id, Action::WriteRecords)?;
        let created = self.crud.create(project_id, table, record).await?;
        self.emit_record(project_id, table, OperationKind::RecordCreated);
        Ok(created)
    }

    pub async fn update_record(
        &self,
        token: &str,
        project_id: &str,
        table: &str,
        id: &str,
        partial: Value,
    ) -> TablesmithResult<Record> {
        self.authorize(token, project_id, Action::WriteRecords)?;
        let updated = self.crud.update(project_id, table, id, partial).await?;
        self.emit_record(project_id, table, OperationKind::RecordUpdated);
        Ok(updated)
    }

    pub async fn delete_record(&self, token: &str, project_id: &str, table: &str, id: &str) -> TablesmithResult<DeleteResponse> {
        self.authorize(token, project_id, Action::WriteRecords)?;
        let deleted = self.crud.delete(project_id, table, id).await?;
        self.emit_record(project_id, table, OperationKind::RecordDeleted);
        Ok(deleted)
    }

    fn emit_record(&self, project_id: &str, table: &str, operation: OperationKind) {
        let table_id = self.table(project_id, table).ok().map(|def| def.table_id);
        self.emit(project_id, table_id.as_deref(), operation);
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}
