//! Observability for the commit path
//!
//! - Structured JSON-lines logging
//! - Named lifecycle events
//! - Relaxed atomic counters
//!
//! Observability never feeds back into commit decisions: a failed log
//! write is dropped, never propagated.
//!
//! ```ignore
//! use aerolog::observability::{log_event, Event, MetricsRegistry};
//!
//! log_event(Event::LogRotate, &[("from", "binlog.000001"), ("to", "binlog.000002")]);
//! let metrics = MetricsRegistry::new();
//! metrics.increment_fsync_count();
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Logs an event at its default severity
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.default_severity(), event.as_str(), fields);
}

/// Logs an event at an explicit severity
pub fn log_event_at(severity: Severity, event: Event, fields: &[(&str, &str)]) {
    Logger::log(severity, event.as_str(), fields);
}
