//! Analytics sink
//!
//! Best-effort emission after each successful mutation. A failing sink is
//! logged and otherwise ignored; it never fails the primary operation.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::events::Event;
use super::logger::Logger;

/// Kind of mutation being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    TableCreated,
    TableAltered,
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    ProjectDeleted,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::TableCreated => "table_created",
            OperationKind::TableAltered => "table_altered",
            OperationKind::RecordCreated => "record_created",
            OperationKind::RecordUpdated => "record_updated",
            OperationKind::RecordDeleted => "record_deleted",
            OperationKind::ProjectDeleted => "project_deleted",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One analytics event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    pub operation: OperationKind,
    pub occurred_at: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn new(project_id: impl Into<String>, table_id: Option<String>, operation: OperationKind) -> Self {
        Self {
            project_id: project_id.into(),
            table_id,
            operation,
            occurred_at: Utc::now(),
        }
    }
}

/// Destination for analytics events
pub trait AnalyticsSink: Send + Sync {
    /// Emits one event. Errors are reported as strings; callers only log them.
    fn emit(&self, event: &AnalyticsEvent) -> Result<(), String>;
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnalytics;

impl AnalyticsSink for NoopAnalytics {
    fn emit(&self, _event: &AnalyticsEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Keeps events in memory; used by tests and the CLI
#[derive(Debug, Default, Clone)]
pub struct MemoryAnalytics {
    events: Arc<Mutex<Vec<AnalyticsEvent>>>,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AnalyticsSink for MemoryAnalytics {
    fn emit(&self, event: &AnalyticsEvent) -> Result<(), String> {
        self.events
            .lock()
            .map_err(|_| "analytics buffer poisoned".to_string())?
            .push(event.clone());
        Ok(())
    }
}

/// Emits `event`, swallowing and logging any sink failure
pub fn emit_best_effort(sink: &dyn AnalyticsSink, event: AnalyticsEvent) {
    if let Err(reason) = sink.emit(&event) {
        Logger::log(
            Event::AnalyticsEmitFailed.severity(),
            Event::AnalyticsEmitFailed.as_str(),
            &[
                ("operation", event.operation.as_str()),
                ("project_id", event.project_id.as_str()),
                ("reason", reason.as_str()),
            ],
        );
    }
}
