//! Decision observers
//!
//! Every verdict the core produces can be watched by registered observers;
//! the built-in one writes structured log lines through `tracing`.

use crate::types::{AccessHook, AccessRequest, Verdict};
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

/// One observed access decision.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    /// Requesting client (destination client for events).
    pub client_index: u32,
    /// Target object.
    pub object_index: u32,
    /// Operation that was decided.
    pub hook: AccessHook,
    /// The verdict returned to the host.
    pub verdict: Verdict,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
}

/// Observer notified of every decision the core makes.
pub trait DecisionObserver: Send + Sync {
    /// Called once per decided request.
    fn on_decision(&self, record: &DecisionRecord);
}

/// Fan-out of decisions to registered observers.
#[derive(Default)]
pub struct DecisionLog {
    observers: RwLock<Vec<Arc<dyn DecisionObserver>>>,
}

impl DecisionLog {
    /// Create an empty decision log
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer
    pub fn register(&self, observer: Arc<dyn DecisionObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    /// Record a decision and notify observers.
    pub fn record(&self, request: &AccessRequest, verdict: Verdict) {
        let record = DecisionRecord {
            client_index: request.client_index,
            object_index: request.object_index,
            hook: request.hook,
            verdict,
            timestamp: Utc::now(),
        };

        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter() {
                observer.on_decision(&record);
            }
        }
    }
}

/// Observer that writes decisions through `tracing`.
pub struct LoggingObserver;

impl DecisionObserver for LoggingObserver {
    fn on_decision(&self, record: &DecisionRecord) {
        match record.verdict {
            Verdict::Grant => tracing::debug!(
                hook = %record.hook,
                object = record.object_index,
                client = record.client_index,
                "operation granted"
            ),
            Verdict::Deny => tracing::info!(
                hook = %record.hook,
                object = record.object_index,
                client = record.client_index,
                "operation denied"
            ),
            Verdict::Pending => tracing::debug!(
                hook = %record.hook,
                object = record.object_index,
                client = record.client_index,
                "operation pending consent"
            ),
        }
    }
}
