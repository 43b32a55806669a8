//! Metrics for the Causeway driver
//!
//! Thin wrappers over the `metrics` facade; the embedding application installs
//! whichever recorder it exports with.
#![allow(clippy::cast_precision_loss)]

use metrics::{counter, gauge, histogram};
use std::time::Instant;

// ============================================================================
// Command Metrics
// ============================================================================

/// Record a command round trip
pub fn record_command(command: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("causeway_commands_total",
        "command" => command.to_string(),
        "status" => status.to_string()
    ).increment(1);
}

/// Record command latency
pub fn record_command_latency(command: &str, latency_ms: f64) {
    histogram!("causeway_command_duration_ms", "command" => command.to_string()).record(latency_ms);
}

/// Record a retried read or write
pub fn record_retry(kind: &str) {
    counter!("causeway_retries_total", "kind" => kind.to_string()).increment(1);
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Update the checked-out server sessions gauge
pub fn set_sessions_checked_out(count: usize) {
    gauge!("causeway_sessions_checked_out").set(count as f64);
}

/// Record a transaction outcome ("committed", "aborted")
pub fn record_transaction(outcome: &str) {
    counter!("causeway_transactions_total", "outcome" => outcome.to_string()).increment(1);
}

// ============================================================================
// Change Stream Metrics
// ============================================================================

/// Record an automatic change stream resume
pub fn record_change_stream_resume() {
    counter!("causeway_change_stream_resumes_total").increment(1);
}

/// Timer guard recording command latency when dropped
pub struct CommandTimer {
    start: Instant,
    command: String,
}

impl CommandTimer {
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            start: Instant::now(),
            command: command.to_string(),
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for CommandTimer {
    fn drop(&mut self) {
        record_command_latency(&self.command, self.elapsed_ms());
    }
}
