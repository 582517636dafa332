//! Breadcrumb sinks for diagnostics.
//!
//! The services never depend on a breadcrumb being observed. Sinks are fire-and-forget and must
//! not block the caller.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::utils::sync::lock;

/// Receives structured breadcrumbs such as `fallback_mode:degraded:memory_pressure`.
pub trait TelemetrySink: fmt::Debug + Send + Sync {
    fn breadcrumb(&self, category: &str, message: String);
}

/// A shared handle to a [`TelemetrySink`].
pub type SharedTelemetry = Arc<dyn TelemetrySink>;

/// Forwards breadcrumbs to the current Sentry hub.
///
/// Without an initialized Sentry client this does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentryTelemetry;

impl TelemetrySink for SentryTelemetry {
    fn breadcrumb(&self, category: &str, message: String) {
        tracing::trace!(category, %message, "breadcrumb");
        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some(category.to_owned()),
            message: Some(message),
            level: sentry::Level::Info,
            ..Default::default()
        });
    }
}

/// Discards every breadcrumb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn breadcrumb(&self, _category: &str, _message: String) {}
}

/// Keeps all breadcrumbs in memory.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    breadcrumbs: Mutex<Vec<(String, String)>>,
}

impl RecordingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded messages, in order.
    pub fn messages(&self) -> Vec<String> {
        lock(&self.breadcrumbs)
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// All recorded messages of the given category, in order.
    pub fn messages_in(&self, category: &str) -> Vec<String> {
        lock(&self.breadcrumbs)
            .iter()
            .filter(|(c, _)| c == category)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn breadcrumb(&self, category: &str, message: String) {
        lock(&self.breadcrumbs).push((category.to_owned(), message));
    }
}
