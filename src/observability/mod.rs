//! Observability for chaos cells
//!
//! - Structured JSON logging
//! - Typed lifecycle and protocol events
//! - Counters
//!
//! Observability is read-only: it never changes the outcome of an
//! operation.
//!
//! # Usage
//!
//! ```ignore
//! use chaos_replication::observability::{log_event_with_fields, Event, MetricsRegistry};
//!
//! log_event_with_fields(Event::EraCommenced, &[("card_id", &card_id), ("era", "3")]);
//!
//! let metrics = MetricsRegistry::new();
//! metrics.increment_eras_commenced();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

use std::sync::atomic::{AtomicBool, Ordering};

static MUTATION_LOGGING: AtomicBool = AtomicBool::new(true);

/// Turn card mutation events on or off
pub fn set_mutation_logging(enabled: bool) {
    MUTATION_LOGGING.store(enabled, Ordering::Relaxed);
}

pub fn is_mutation_logging_enabled() -> bool {
    MUTATION_LOGGING.load(Ordering::Relaxed)
}

fn severity_of(event: Event) -> Severity {
    if event.is_fatal() {
        Severity::Fatal
    } else {
        Severity::Info
    }
}

/// Log a lifecycle event
pub fn log_event(event: Event) {
    log_event_with_fields(event, &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    if event.is_mutation() && !is_mutation_logging_enabled() {
        return;
    }
    Logger::log(severity_of(event), event.as_str(), fields);
}

/// Log an event describing a rejected or failed operation
pub fn log_warning(event: Event, fields: &[(&str, &str)]) {
    Logger::warn(event.as_str(), fields);
}
