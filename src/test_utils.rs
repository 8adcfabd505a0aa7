//! Test utilities shared across module tests.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::broker::BrokerError;
use crate::registry::ConnectionHandle;
use crate::report::{ErrorReporter, ReportTags};

/// AMQP URL for integration tests.
pub fn amqp_url() -> String {
    std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
}

/// A connection handle plus the receiving end standing in for the
/// connection task.
pub fn open_connection() -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConnectionHandle::new(tx), rx)
}

/// One captured report.
#[derive(Debug, Clone)]
pub struct RecordedReport {
    pub error: String,
    pub tags: ReportTags,
    pub payload: Option<Value>,
}

/// Reporter that records instead of emitting.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<RecordedReport>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn reports(&self) -> Vec<RecordedReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &BrokerError, tags: ReportTags, payload: Option<&Value>) {
        self.reports.lock().unwrap().push(RecordedReport {
            error: error.to_string(),
            tags,
            payload: payload.cloned(),
        });
    }
}
