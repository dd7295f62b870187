//! Observable lifecycle events
//!
//! Events are explicit and typed; the string form is the `event` key of
//! the log line.

use std::fmt;

use super::logger::Severity;

/// Observable events in tablesmith
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Platform opened and catalog loaded
    PlatformReady,
    /// Configuration loaded
    ConfigLoaded,
    /// Catalog metadata loaded from storage
    CatalogLoaded,

    // Catalog
    /// Table registered in the catalog
    TableCreated,
    /// Schema version recorded by alter_table
    TableAltered,
    /// Display metadata or table options changed
    TableMetadataUpdated,

    // Namespaces
    /// Project namespace allocated
    NamespaceAllocated,
    /// Project namespace dropped with every table in it
    NamespaceDropped,

    // Migrations
    /// Migration job queued
    MigrationEnqueued,
    /// Schema version applied to the physical table
    MigrationApplied,
    /// Schema version rolled back and marked failed
    MigrationFailed,
    /// Pending versions found at startup re-queued
    MigrationRecovered,
    /// Narrowing policy rewrote existing values
    LossyNarrowingApplied,

    // Records
    /// Record created
    RecordCreated,
    /// Record updated
    RecordUpdated,
    /// Record deleted
    RecordDeleted,
    /// Write rejected by validation
    RecordRejected,

    // Security
    /// Caller touched a project outside its accessible set
    TenantIsolationViolation,
    /// Caller's role does not allow the operation
    PermissionDenied,

    // Collaborators
    /// Analytics sink rejected an event
    AnalyticsEmitFailed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::PlatformReady => "PLATFORM_READY",
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::CatalogLoaded => "CATALOG_LOADED",
            Event::TableCreated => "TABLE_CREATED",
            Event::TableAltered => "TABLE_ALTERED",
            Event::TableMetadataUpdated => "TABLE_METADATA_UPDATED",
            Event::NamespaceAllocated => "NAMESPACE_ALLOCATED",
            Event::NamespaceDropped => "NAMESPACE_DROPPED",
            Event::MigrationEnqueued => "MIGRATION_ENQUEUED",
            Event::MigrationApplied => "MIGRATION_APPLIED",
            Event::MigrationFailed => "MIGRATION_FAILED",
            Event::MigrationRecovered => "MIGRATION_RECOVERED",
            Event::LossyNarrowingApplied => "LOSSY_NARROWING_APPLIED",
            Event::RecordCreated => "RECORD_CREATED",
            Event::RecordUpdated => "RECORD_UPDATED",
            Event::RecordDeleted => "RECORD_DELETED",
            Event::RecordRejected => "RECORD_REJECTED",
            Event::TenantIsolationViolation => "TENANT_ISOLATION_VIOLATION",
            Event::PermissionDenied => "PERMISSION_DENIED",
            Event::AnalyticsEmitFailed => "ANALYTICS_EMIT_FAILED",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::RecordCreated | Event::RecordUpdated | Event::RecordDeleted => Severity::Trace,
            Event::RecordRejected => Severity::Trace,
            Event::LossyNarrowingApplied
            | Event::AnalyticsEmitFailed
            | Event::PermissionDenied => Severity::Warn,
            Event::MigrationFailed | Event::TenantIsolationViolation => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_events_are_loud() {
        assert_eq!(Event::TenantIsolationViolation.severity(), Severity::Error);
        assert_eq!(Event::MigrationFailed.severity(), Severity::Error);
        assert_eq!(Event::RecordCreated.severity(), Severity::Trace);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Event::MigrationApplied.as_str(), "MIGRATION_APPLIED");
        assert_eq!(format!("{}", Event::NamespaceDropped), "NAMESPACE_DROPPED");
    }
}
