//! # Metrics Sink
//!
//! Narrow seam between the dispatch core and whatever telemetry backend an
//! embedder runs. The core only emits counters: retry attempts per service,
//! error counts per code, circuit breaker transitions, and task completions.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::resilience::CircuitState;

/// Receiver for the core's operational counters.
///
/// Implementations must be cheap: sinks are called inline from the scheduler
/// loop and the retry path.
pub trait MetricsSink: Send + Sync {
    /// A retry is about to be performed against `service`.
    fn record_retry(&self, service: &str);

    /// A classified error code was observed.
    fn record_error(&self, code: &str);

    /// A circuit breaker changed state.
    fn record_circuit_transition(&self, service: &str, state: CircuitState);

    /// A dispatched task finished on `worker_id`.
    fn record_task_completion(&self, worker_id: &str, duration: Duration, success: bool);
}

/// Default sink: emits structured tracing events and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_retry(&self, service: &str) {
        debug!(service = %service, "retry recorded");
    }

    fn record_error(&self, code: &str) {
        debug!(code = %code, "error recorded");
    }

    fn record_circuit_transition(&self, service: &str, state: CircuitState) {
        info!(service = %service, state = ?state, "circuit breaker transition");
    }

    fn record_task_completion(&self, worker_id: &str, duration: Duration, success: bool) {
        debug!(
            worker_id = %worker_id,
            duration_ms = duration.as_millis() as u64,
            success = success,
            "task completion recorded"
        );
    }
}

/// Point-in-time view of an [`InMemoryMetricsSink`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub retries_by_service: HashMap<String, u64>,
    pub errors_by_code: HashMap<String, u64>,
    pub circuit_states: HashMap<String, CircuitState>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// Counter-backed sink for tests and embedders that poll rather than stream.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    retries: Mutex<HashMap<String, u64>>,
    errors: Mutex<HashMap<String, u64>>,
    circuit_states: Mutex<HashMap<String, CircuitState>>,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_count(&self, service: &str) -> u64 {
        self.retries.lock().get(service).copied().unwrap_or(0)
    }

    pub fn error_count(&self, code: &str) -> u64 {
        self.errors.lock().get(code).copied().unwrap_or(0)
    }

    pub fn circuit_state(&self, service: &str) -> Option<CircuitState> {
        self.circuit_states.lock().get(service).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            retries_by_service: self.retries.lock().clone(),
            errors_by_code: self.errors.lock().clone(),
            circuit_states: self.circuit_states.lock().clone(),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record_retry(&self, service: &str) {
        *self.retries.lock().entry(service.to_string()).or_insert(0) += 1;
    }

    fn record_error(&self, code: &str) {
        *self.errors.lock().entry(code.to_string()).or_insert(0) += 1;
    }

    fn record_circuit_transition(&self, service: &str, state: CircuitState) {
        self.circuit_states.lock().insert(service.to_string(), state);
    }

    fn record_task_completion(&self, _worker_id: &str, _duration: Duration, success: bool) {
        if success {
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_counts_retries_and_errors() {
        let sink = InMemoryMetricsSink::new();
        sink.record_retry("database");
        sink.record_retry("database");
        sink.record_error("DB_QUERY_TIMEOUT");

        assert_eq!(sink.retry_count("database"), 2);
        assert_eq!(sink.retry_count("search"), 0);
        assert_eq!(sink.error_count("DB_QUERY_TIMEOUT"), 1);
    }

    #[test]
    fn snapshot_reflects_completions() {
        let sink = InMemoryMetricsSink::new();
        sink.record_task_completion("worker-1", Duration::from_millis(5), true);
        sink.record_task_completion("worker-1", Duration::from_millis(7), false);
        sink.record_circuit_transition("database", CircuitState::Open);

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(
            snapshot.circuit_states.get("database").copied(),
            Some(CircuitState::Open)
        );
    }
}
