//! Task types, lifecycle records, and the cooperative preemption token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::TaskFailure;

/// Opaque task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// A unit of work submitted to the scheduler. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Capability tag matched against worker capability sets
    pub task_type: String,
    /// Urgency, 1 (lowest) to 10 (highest)
    pub priority: u8,
    pub params: Map<String, Value>,
    pub submitted_at: DateTime<Utc>,
    /// Monotonic submission sequence, tie-breaker within a priority band
    pub seq: u64,
}

/// Cooperative cancellation flag handed to every handler invocation.
///
/// Preemption signals the token; a handler observes it at safe checkpoints
/// and returns [`TaskFailure::cancelled`]. A handler that never checks the
/// flag runs to completion — preemption is best-effort, not termination.
#[derive(Debug, Clone, Default)]
pub struct PreemptionToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl PreemptionToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the holder to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves when the token is cancelled. Usable in `tokio::select!`
    /// against the handler's own work.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Handler interface implemented by agent workers.
///
/// Opaque to the scheduler beyond its declared capability tags: the params
/// go in, a value or a structured failure comes out.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        params: &Map<String, Value>,
        token: &PreemptionToken,
    ) -> Result<Value, TaskFailure>;
}

/// Shared per-task record backing the status/result API.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub status: TaskStatus,
    pub result: Option<Result<Value, TaskFailure>>,
    pub notify: Arc<Notify>,
}

impl TaskRecord {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            notify: Arc::new(Notify::new()),
        }
    }
}
