//! Asynchronous migrator
//!
//! Receives queued schema versions and applies each one on the blocking
//! pool under a deadline. Versions of one table are serialized by a
//! per-table async lock; versions of different tables run as independent
//! tasks. Outcomes are broadcast as `MigrationReport`s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::ddl::{self, MigrationError};
use super::{MigrationJob, MigrationReceiver};
use crate::catalog::{store, Catalog, SchemaVersion, TableDefinition, TableStatus, VersionChange, VersionStatus};
use crate::identifier::IdentifierMapper;
use crate::observability::{log_event, Event, Logger, MetricsRegistry, ObservationScope};
use crate::registry::FieldTypeRegistry;
use crate::storage::{run_blocking, CancelToken, StorageEngine};

/// Capacity of the report channel; slow subscribers see `Lagged`
const REPORT_CAPACITY: usize = 256;

/// Terminal state of one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Applied { lossy_rows: u64 },
    Failed { error: String },
}

/// Published when a version reaches a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub table_id: String,
    pub version: u64,
    pub outcome: MigrationOutcome,
}

/// Applies queued schema versions
pub struct Migrator {
    engine: StorageEngine,
    catalog: Arc<Catalog>,
    registry: Arc<FieldTypeRegistry>,
    mapper: IdentifierMapper,
    metrics: Arc<MetricsRegistry>,
    timeout: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    reports: broadcast::Sender<MigrationReport>,
}

impl Migrator {
    pub fn new(
        engine: StorageEngine,
        catalog: Arc<Catalog>,
        registry: Arc<FieldTypeRegistry>,
        metrics: Arc<MetricsRegistry>,
        timeout: Duration,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            engine,
            catalog,
            registry,
            mapper: IdentifierMapper::new(),
            metrics,
            timeout,
            locks: Mutex::new(HashMap::new()),
            reports,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationReport> {
        self.reports.subscribe()
    }

    /// Starts the dispatch loop. It ends when every job sender is gone.
    pub fn spawn(self: &Arc<Self>, mut jobs: MigrationReceiver) -> JoinHandle<()> {
        let migrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let worker = Arc::clone(&migrator);
                tokio::spawn(async move {
                    worker.apply(job).await;
                });
            }
        })
    }

    fn table_lock(&self, table_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(table_id.to_string()).or_default())
    }

    /// Applies one version and publishes its report
    pub async fn apply(&self, job: MigrationJob) -> MigrationReport {
        let entry = job.entry;
        let lock = self.table_lock(&entry.table_id);
        let _serial = lock.lock().await;

        let version = entry.version.to_string();
        let scope = ObservationScope::new(
            "MIGRATION",
            &[("table_id", entry.table_id.as_str()), ("version", version.as_str())],
        );

        let engine = self.engine.clone();
        let registry = Arc::clone(&self.registry);
        let mapper = self.mapper;
        let pending = entry.clone();
        let result = run_blocking("migration", self.timeout, move |cancel| {
            Ok(apply_version(&engine, &mapper, &registry, &pending, &cancel))
        })
        .await;

        let outcome = match result {
            Ok(Ok(applied)) => {
                let lossy_rows = applied.lossy_rows;
                if let Err(e) = self.catalog.finish_migration(applied.snapshot) {
                    Logger::error("CATALOG_UPDATE_FAILED", &[("reason", e.message())]);
                }
                self.metrics.increment_migrations_applied();
                let rows = lossy_rows.to_string();
                if lossy_rows > 0 {
                    log_event(
                        Event::LossyNarrowingApplied,
                        &[
                            ("table_id", entry.table_id.as_str()),
                            ("version", version.as_str()),
                            ("rows", rows.as_str()),
                        ],
                    );
                }
                log_event(
                    Event::MigrationApplied,
                    &[("table_id", entry.table_id.as_str()), ("version", version.as_str())],
                );
                scope.complete(&[("lossy_rows", rows.as_str())]);
                MigrationOutcome::Applied { lossy_rows }
            }
            Ok(Err(err)) => {
                let reason = self.describe(&err);
                self.record_failure(&entry, &reason).await;
                scope.fail(&reason);
                MigrationOutcome::Failed { error: reason }
            }
            Err(err) => {
                let reason = err.message().to_string();
                self.record_failure(&entry, &reason).await;
                scope.fail(&reason);
                MigrationOutcome::Failed { error: reason }
            }
        };

        let report = MigrationReport {
            table_id: entry.table_id.clone(),
            version: entry.version,
            outcome,
        };
        // No subscribers is fine
        let _ = self.reports.send(report.clone());
        report
    }

    fn describe(&self, err: &MigrationError) -> String {
        match err {
            MigrationError::Cancelled => {
                self.metrics.increment_timeouts();
                format!(
                    "migration exceeded its deadline of {} ms and was rolled back",
                    self.timeout.as_millis()
                )
            }
            MigrationError::Storage(source) => {
                let detail = source.to_string();
                Logger::error("MIGRATION_STORAGE_FAILURE", &[("detail", detail.as_str())]);
                err.to_string()
            }
            other => other.to_string(),
        }
    }

    /// Marks the version failed and reverts the table to its last applied
    /// definition, in one transaction.
    async fn record_failure(&self, entry: &SchemaVersion, reason: &str) {
        self.metrics.increment_migrations_failed();
        let version = entry.version.to_string();
        log_event(
            Event::MigrationFailed,
            &[
                ("table_id", entry.table_id.as_str()),
                ("version", version.as_str()),
                ("reason", reason),
            ],
        );

        let now = Utc::now();
        let mut reverted = reverted_definition(entry);
        reverted.updated_at = now;

        let mut failed = entry.clone();
        failed.status = VersionStatus::Failed;
        failed.error = Some(reason.to_string());
        failed.completed_at = Some(now);

        let engine = self.engine.clone();
        let definition = reverted.clone();
        let persisted = run_blocking("migration_failure", self.timeout, move |cancel| {
            engine
                .transaction(&cancel, |tx| {
                    store::update_version(tx, &failed)?;
                    store::update_table(tx, &definition)
                })
                .map_err(Into::into)
        })
        .await;
        if let Err(e) = persisted {
            // The version stays pending on disk and is retried at startup;
            // the table keeps reporting Migrating until then.
            Logger::error(
                "MIGRATION_FAILURE_NOT_RECORDED",
                &[("table_id", entry.table_id.as_str()), ("reason", e.message())],
            );
            return;
        }
        if let Err(e) = self.catalog.finish_migration(reverted) {
            Logger::error("CATALOG_UPDATE_FAILED", &[("reason", e.message())]);
        }
    }
}

/// Plans and executes one version in a single transaction, marking it
/// applied in the same transaction.
fn apply_version(
    engine: &StorageEngine,
    mapper: &IdentifierMapper,
    registry: &FieldTypeRegistry,
    entry: &SchemaVersion,
    cancel: &CancelToken,
) -> Result<SchemaVersion, MigrationError> {
    let steps = match (&entry.change, &entry.previous) {
        (VersionChange::CreateTable, _) => ddl::plan_create(mapper, &entry.snapshot)?,
        (VersionChange::AlterFields { ops, confirmation }, Some(previous)) => {
            ddl::plan_alter(mapper, registry, previous, ops, confirmation.overflow)?
        }
        (VersionChange::AlterFields { .. }, None) => {
            return Err(MigrationError::InvalidField {
                field: String::new(),
                reason: "version has no previous definition".into(),
            })
        }
        (VersionChange::UpdateDisplay { .. }, _) | (VersionChange::SetSoftDelete { .. }, _) => Vec::new(),
    };

    engine.try_transaction(cancel, |tx| {
        let outcome = ddl::execute(tx, &steps)?;
        let mut applied = entry.clone();
        applied.status = VersionStatus::Applied;
        applied.lossy_rows = outcome.lossy_rows;
        applied.completed_at = Some(Utc::now());
        store::update_version(tx, &applied)?;
        store::update_table(tx, &applied.snapshot)?;
        Ok(applied)
    })
}

/// Definition the catalog serves once `entry` has failed
fn reverted_definition(entry: &SchemaVersion) -> TableDefinition {
    let mut reverted = entry
        .previous
        .clone()
        .unwrap_or_else(|| entry.snapshot.clone());
    reverted.current_version = entry.version;
    reverted.status = TableStatus::Ready;
    reverted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Confirmation, FieldDefinition, FieldOp, NewTable};
    use crate::registry::LogicalType;

    fn setup(timeout: Duration) -> (Arc<Catalog>, Migrator, MigrationReceiver, StorageEngine) {
        let engine = StorageEngine::open_in_memory().unwrap();
        let registry = Arc::new(FieldTypeRegistry::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let (catalog, rx) = Catalog::open(engine.clone(), Arc::clone(&registry), Arc::clone(&metrics)).unwrap();
        let catalog = Arc::new(catalog);
        let migrator = Migrator::new(engine.clone(), Arc::clone(&catalog), registry, metrics, timeout);
        (catalog, migrator, rx, engine)
    }

    fn add_field(catalog: &Catalog, table_id: &str, field: FieldDefinition) {
        catalog
            .alter_table(
                &CancelToken::new(),
                table_id,
                vec![FieldOp::Add { field }],
                Confirmation::none(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_applied_version_updates_catalog_and_log() {
        let (catalog, migrator, mut rx, _engine) = setup(Duration::from_secs(5));
        let def = catalog
            .create_table(
                &CancelToken::new(),
                "p1",
                NewTable::new("clients", vec![FieldDefinition::new("name", LogicalType::short_text())]),
            )
            .unwrap();
        add_field(&catalog, &def.table_id, FieldDefinition::new("phone", LogicalType::short_text()));

        let mut reports = migrator.subscribe();
        let report = migrator.apply(rx.try_recv().unwrap()).await;
        assert_eq!(report.outcome, MigrationOutcome::Applied { lossy_rows: 0 });
        assert_eq!(reports.recv().await.unwrap(), report);

        let stored = catalog.get_table_by_id(&def.table_id).unwrap();
        assert!(stored.is_ready());
        assert_eq!(stored.applied_version, 2);
        assert!(stored.field("phone").is_some());
        assert_eq!(
            catalog.version_status(&def.table_id, 2).unwrap(),
            Some(VersionStatus::Applied)
        );
    }

    #[tokio::test]
    async fn test_failed_version_reverts_definition() {
        let (catalog, migrator, mut rx, engine) = setup(Duration::from_secs(5));
        let def = catalog
            .create_table(
                &CancelToken::new(),
                "p1",
                NewTable::new("clients", vec![FieldDefinition::new("email", LogicalType::Email)]),
            )
            .unwrap();
        let column = IdentifierMapper::new().column("email").unwrap();
        engine
            .transaction(&CancelToken::new(), |tx| {
                for id in ["a", "b"] {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (\"_id\", \"_created_at\", \"_updated_at\", {}) VALUES (?1, 'x', 'x', 'dup@x.com')",
                            def.physical_name.quoted(),
                            column.quoted()
                        ),
                        [id],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        catalog
            .alter_table(
                &CancelToken::new(),
                &def.table_id,
                vec![FieldOp::SetUnique {
                    name: "email".into(),
                    unique: true,
                }],
                Confirmation::none(),
            )
            .unwrap();
        let report = migrator.apply(rx.try_recv().unwrap()).await;
        assert!(matches!(report.outcome, MigrationOutcome::Failed { ref error } if error.contains("email")));

        let stored = catalog.get_table_by_id(&def.table_id).unwrap();
        assert!(stored.is_ready());
        assert!(!stored.field("email").unwrap().unique);
        assert_eq!(stored.current_version, 2);
        assert_eq!(stored.applied_version, 1);
        let versions = catalog.schema_versions(&def.table_id).unwrap();
        assert_eq!(versions[1].status, VersionStatus::Failed);
    }

    #[tokio::test]
    async fn test_unrecorded_failure_keeps_table_migrating() {
        let (catalog, migrator, mut rx, engine) = setup(Duration::from_secs(5));
        let def = catalog
            .create_table(
                &CancelToken::new(),
                "p1",
                NewTable::new("clients", vec![FieldDefinition::new("name", LogicalType::short_text())]),
            )
            .unwrap();
        add_field(&catalog, &def.table_id, FieldDefinition::new("phone", LogicalType::short_text()));
        engine
            .transaction(&CancelToken::new(), |tx| {
                tx.execute_batch("DROP TABLE __tablesmith_versions")?;
                Ok(())
            })
            .unwrap();

        let report = migrator.apply(rx.try_recv().unwrap()).await;
        assert!(matches!(report.outcome, MigrationOutcome::Failed { .. }));

        let stored = catalog.get_table_by_id(&def.table_id).unwrap();
        assert_eq!(stored.status, TableStatus::Migrating);
        assert_eq!(stored.applied_version, 1);
        assert_eq!(
            catalog.version_status(&def.table_id, 2).unwrap(),
            Some(VersionStatus::Pending)
        );
    }
}
