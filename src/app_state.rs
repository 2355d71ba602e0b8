// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the long-lived components together for the REST layer. Every field is
// an `Arc` handle to a component that manages its own interior mutability;
// nothing here is process-global.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::exit::PositionMonitor;
use crate::ledger::PositionLedger;
use crate::orchestrator::TradingOrchestrator;
use crate::runtime_config::RuntimeConfig;

// =============================================================================
// Error Log
// =============================================================================

/// A recorded failure for the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    /// What was being attempted (`entry`, `monitor`, `manual_close`, ...).
    pub action: String,
    /// Machine-readable category (`order_rejected`, `persistence`, ...).
    pub code: Option<String>,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Bounded ring of recent errors, newest last.
#[derive(Debug, Default)]
pub struct ErrorLog {
    records: RwLock<VecDeque<ErrorRecord>>,
}

impl ErrorLog {
    pub fn record(&self, action: &str, code: Option<&str>, message: String) {
        let record = ErrorRecord {
            action: action.to_string(),
            code: code.map(str::to_string),
            message,
            at: Utc::now().to_rfc3339(),
        };

        let mut records = self.records.write();
        records.push_back(record);
        while records.len() > MAX_RECENT_ERRORS {
            records.pop_front();
        }
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.records.read().iter().rev().cloned().collect()
    }

    pub fn latest_for(&self, action: &str) -> Option<ErrorRecord> {
        self.records
            .read()
            .iter()
            .rev()
            .find(|r| r.action == action)
            .cloned()
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared across the API handlers via `Arc<AppState>`.
pub struct AppState {
    pub config: Arc<RuntimeConfig>,
    pub ledger: Arc<PositionLedger>,
    pub monitor: Arc<PositionMonitor>,
    pub orchestrator: Arc<TradingOrchestrator>,
    pub errors: Arc<ErrorLog>,
    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Arc<RuntimeConfig>,
        ledger: Arc<PositionLedger>,
        monitor: Arc<PositionMonitor>,
        orchestrator: Arc<TradingOrchestrator>,
        errors: Arc<ErrorLog>,
    ) -> Self {
        Self {
            config,
            ledger,
            monitor,
            orchestrator,
            errors,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_log_is_bounded_and_newest_first() {
        let log = ErrorLog::default();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            log.record("entry", None, format!("e{i}"));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), MAX_RECENT_ERRORS);
        assert_eq!(recent[0].message, format!("e{}", MAX_RECENT_ERRORS + 4));
    }

    #[test]
    fn latest_per_action() {
        let log = ErrorLog::default();
        log.record("entry", Some("gateway"), "first".into());
        log.record("manual_close", Some("invalid_state"), "closed".into());
        log.record("entry", Some("order_rejected"), "second".into());

        assert_eq!(log.latest_for("entry").unwrap().message, "second");
        assert_eq!(log.latest_for("manual_close").unwrap().code.as_deref(), Some("invalid_state"));
        assert!(log.latest_for("monitor").is_none());
    }
}
