//! Observability subsystem
//!
//! - Structured logging (JSON lines)
//! - Typed lifecycle events
//! - Operational counters
//! - Best-effort analytics emission
//!
//! Observability never affects the outcome of the operation it observes.
//!
//! ```ignore
//! use tablesmith::observability::{log_event, Event, Logger};
//!
//! Logger::info("CUSTOM_EVENT", &[("rows", "42")]);
//! log_event(Event::TableCreated, &[("table", "clients")]);
//! ```

mod analytics;
mod events;
mod logger;
mod metrics;
mod scope;

pub use analytics::{
    emit_best_effort, AnalyticsEvent, AnalyticsSink, MemoryAnalytics, NoopAnalytics, OperationKind,
};
pub use events::Event;
pub use logger::{Logger, Severity, LOG_LEVEL_ENV};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::ObservationScope;

/// Logs a lifecycle event at its own severity
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::PlatformReady, &[]);
        log_event(Event::TableCreated, &[("table", "clients")]);
    }
}
