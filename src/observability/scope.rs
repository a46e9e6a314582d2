//! ObservationScope for begin/complete logging
//!
//! - Logs `{name}_BEGIN` on creation
//! - Logs `{name}_COMPLETE` or `{name}_FAILED` when finished
//! - Logs `{name}_INCOMPLETE` when dropped unfinished

use std::sync::atomic::{AtomicBool, Ordering};

use super::logger::Logger;

/// A scope that logs the start and the outcome of a multi-step operation
///
/// # Usage
///
/// ```ignore
/// let scope = ObservationScope::with_fields("ERA_ADVANCE", &[("card_id", &id)]);
/// // ... revoke, commence, grant ...
/// scope.complete_with_fields(&[("era", &era)]);
/// ```
///
/// The scope is `Send`, so it may be held across `.await` points.
pub struct ObservationScope {
    name: &'static str,
    completed: AtomicBool,
    fields: Vec<(&'static str, String)>,
}

impl ObservationScope {
    /// Create a new observation scope, logging `{name}_BEGIN`
    pub fn new(name: &'static str) -> Self {
        Self::with_fields(name, &[])
    }

    /// Create a new observation scope with fields repeated on every line
    pub fn with_fields(name: &'static str, fields: &[(&'static str, &str)]) -> Self {
        let event = format!("{}_BEGIN", name);
        Logger::trace(&event, fields);

        Self {
            name,
            completed: AtomicBool::new(false),
            fields: fields.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        }
    }

    fn field_refs(&self) -> Vec<(&str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    /// Mark the scope as successfully completed
    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    /// Mark the scope as successfully completed with additional fields
    pub fn complete_with_fields(self, extra_fields: &[(&str, &str)]) {
        self.completed.store(true, Ordering::Relaxed);
        let event = format!("{}_COMPLETE", self.name);
        let mut all_fields = self.field_refs();
        all_fields.extend(extra_fields.iter().copied());
        Logger::info(&event, &all_fields);
    }

    /// Mark the scope as failed with a reason
    pub fn fail(self, reason: &str) {
        self.completed.store(true, Ordering::Relaxed);
        let event = format!("{}_FAILED", self.name);
        let mut all_fields = self.field_refs();
        all_fields.push(("reason", reason));
        Logger::error(&event, &all_fields);
    }

    /// Check if the scope has been completed
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.completed.load(Ordering::Relaxed) {
            let event = format!("{}_INCOMPLETE", self.name);
            let mut all_fields = self.field_refs();
            all_fields.push(("reason", "scope dropped without completion"));
            Logger::warn(&event, &all_fields);
        }
    }
}

/// A simple duration timer for logging elapsed time
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Get elapsed milliseconds as a string
    pub fn elapsed_ms(&self) -> String {
        self.start.elapsed().as_millis().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
