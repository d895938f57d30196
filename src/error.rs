//! # Structured Error Handling
//!
//! Error taxonomy for the dispatch core. Callers see typed failures
//! ([`DispatchError`]) while task results carry a serializable, user-visible
//! [`TaskFailure`] with a stable code rather than raw exception text.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classification::ErrorCategory;

/// Stable failure codes surfaced in task results and metrics.
pub mod codes {
    pub const NO_CAPABLE_WORKER: &str = "NO_CAPABLE_WORKER";
    pub const TASK_CANCELLED: &str = "TASK_CANCELLED";
    pub const SCHEDULER_SHUTDOWN: &str = "SCHEDULER_SHUTDOWN";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const CACHE_WAIT_FAILED: &str = "CACHE_WAIT_FAILED";
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// User-visible structured failure attached to a failed task result.
///
/// Cloneable and serializable so a single failure can fan out to every
/// coalesced cache waiter and be recorded in the task result table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Stable failure code (see [`codes`] and the classifier's service table)
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Logical dependency name, when the failure originated in one
    pub service: Option<String>,
}

impl TaskFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            service: None,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Failure reported by a handler that honored a preemption signal.
    pub fn cancelled() -> Self {
        Self::new(codes::TASK_CANCELLED, "task cancelled before completion")
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == codes::TASK_CANCELLED
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(service) => write!(f, "[{}] {} ({})", self.code, self.message, service),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Raw failure reported by an external dependency, before classification.
///
/// Carries whatever the dependency declared about itself: an HTTP-ish status,
/// a vendor code, and a message. The classifier inspects these fields only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{service}: {message}")]
pub struct ServiceError {
    pub service: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

impl ServiceError {
    pub fn new(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Errors produced by the dispatch core itself.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid priority {priority}: must be between 1 and 10")]
    InvalidPriority { priority: u8 },

    #[error("no registered worker is capable of handling '{task_type}'")]
    NoCapableWorker { task_type: String },

    #[error("circuit breaker is open for {service}")]
    CircuitOpen { service: String },

    #[error("retries exhausted for {service} after {attempts} attempts")]
    RetryExhausted {
        service: String,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error("{service} failed with non-retryable {category} error")]
    NonRetryable {
        service: String,
        category: ErrorCategory,
        #[source]
        source: ServiceError,
    },

    #[error("unknown task: {task_id}")]
    TaskNotFound { task_id: uuid::Uuid },

    #[error("task failed: {0}")]
    HandlerFailed(TaskFailure),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("scheduler is shutting down")]
    SchedulerShutdown,
}

impl DispatchError {
    /// Convert into the structured failure recorded as a task result.
    pub fn into_task_failure(self) -> TaskFailure {
        match self {
            DispatchError::NoCapableWorker { task_type } => TaskFailure::new(
                codes::NO_CAPABLE_WORKER,
                format!("no registered worker is capable of handling '{task_type}'"),
            ),
            DispatchError::SchedulerShutdown => TaskFailure::new(
                codes::SCHEDULER_SHUTDOWN,
                "scheduler shut down before the task completed",
            ),
            DispatchError::HandlerFailed(failure) => failure,
            DispatchError::CircuitOpen { service } => TaskFailure::new(
                codes::CIRCUIT_OPEN,
                format!("circuit breaker is open for {service}"),
            )
            .with_service(service),
            other => TaskFailure::new(codes::UNKNOWN, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failure_display_includes_service() {
        let failure =
            TaskFailure::new("DB_CONNECTION_FAILURE", "connection refused").with_service("database");
        assert_eq!(
            failure.to_string(),
            "[DB_CONNECTION_FAILURE] connection refused (database)"
        );
    }

    #[test]
    fn cancelled_failure_is_recognized() {
        assert!(TaskFailure::cancelled().is_cancellation());
        assert!(!TaskFailure::new("OTHER", "nope").is_cancellation());
    }

    #[test]
    fn no_capable_worker_converts_to_structured_failure() {
        let err = DispatchError::NoCapableWorker {
            task_type: "search".to_string(),
        };
        let failure = err.into_task_failure();
        assert_eq!(failure.code, codes::NO_CAPABLE_WORKER);
        assert!(failure.message.contains("search"));
    }
}
