//! # Task Scheduler
//!
//! Priority-aware dispatch of tasks to a bounded pool of concurrent agent
//! workers.
//!
//! ## Architecture
//!
//! All queue and worker-table mutation happens on a single coordinator loop
//! fed by an mpsc command channel, so priority ordering and load counters
//! are never raced. Dispatched task bodies run in parallel on spawned tokio
//! tasks and report back through the same channel.
//!
//! ## Dispatch rules
//!
//! - Pending tasks are ordered by priority (desc) then submission order
//!   (FIFO within a priority band).
//! - At most `max_concurrent` tasks execute simultaneously; when a slot
//!   frees, the highest-priority waiting task goes next.
//! - Worker selection among capable workers: lowest current load, ties by
//!   lowest average response time.
//! - An arrival at or above the preemption threshold, finding every slot
//!   held by strictly lower-priority work, signals exactly one
//!   lowest-priority running task for cooperative cancellation; the
//!   preempted task is re-queued at its original priority.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dispatch_core::config::SchedulerConfig;
//! use dispatch_core::metrics::TracingMetricsSink;
//! use dispatch_core::scheduler::TaskScheduler;
//! use serde_json::{json, Map};
//! use std::sync::Arc;
//!
//! # async fn example(handler: Arc<dyn dispatch_core::scheduler::TaskHandler>) -> dispatch_core::Result<()> {
//! let scheduler = TaskScheduler::new(SchedulerConfig::default(), Arc::new(TracingMetricsSink));
//! scheduler.register_worker("agent-1", ["search"], handler).await?;
//!
//! let mut params = Map::new();
//! params.insert("query".to_string(), json!("rust schedulers"));
//! let value = scheduler.submit_and_wait("search", 5, params).await?;
//! # Ok(())
//! # }
//! ```

pub mod task;
pub mod worker;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{DispatchError, Result, TaskFailure};
use crate::metrics::MetricsSink;

pub use task::{PreemptionToken, Task, TaskHandler, TaskId, TaskStatus};
pub use worker::WorkerInfo;

use task::TaskRecord;
use worker::WorkerTable;

/// Point-in-time view of scheduler state, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub queued: usize,
    pub running: usize,
    pub workers: Vec<WorkerInfo>,
}

/// Heap entry: max-heap on priority, FIFO within a band.
struct QueuedTask {
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.task.seq == other.task.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.task.seq.cmp(&self.task.seq))
    }
}

struct RunningTask {
    priority: u8,
    token: PreemptionToken,
    /// Monotonic dispatch order, used for the preemption tie-break
    dispatch_seq: u64,
}

enum TaskOutcome {
    Completed(Value),
    Failed(TaskFailure),
    /// Handler honored the preemption signal; the task goes back in queue
    Preempted(Task),
}

enum Command {
    Submit {
        task_type: String,
        priority: u8,
        params: Map<String, Value>,
        reply: oneshot::Sender<Result<TaskId>>,
    },
    RegisterWorker {
        id: String,
        capabilities: HashSet<String>,
        handler: Arc<dyn TaskHandler>,
        reply: oneshot::Sender<()>,
    },
    DeregisterWorker {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Finished {
        task_id: TaskId,
        worker_id: String,
        outcome: TaskOutcome,
        elapsed: Duration,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Priority-aware task scheduler over a bounded worker pool.
///
/// Cloneable handle; all clones talk to the same coordinator.
#[derive(Clone)]
pub struct TaskScheduler {
    tx: mpsc::UnboundedSender<Command>,
    records: Arc<DashMap<TaskId, TaskRecord>>,
}

impl TaskScheduler {
    /// Create a scheduler and spawn its coordinator loop onto the current
    /// tokio runtime.
    pub fn new(config: SchedulerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let records = Arc::new(DashMap::new());

        info!(
            max_concurrent = config.max_concurrent,
            preemption_threshold = config.preemption_threshold,
            "task scheduler starting"
        );

        let coordinator = Coordinator {
            config,
            workers: WorkerTable::new(),
            queue: BinaryHeap::new(),
            running: HashMap::new(),
            records: records.clone(),
            tx: tx.clone(),
            metrics,
            next_seq: 0,
            next_dispatch_seq: 0,
            shutting_down: false,
            shutdown_reply: None,
        };
        tokio::spawn(coordinator.run(rx));

        Self { tx, records }
    }

    /// Register a worker with its capability tags and handler.
    pub async fn register_worker(
        &self,
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RegisterWorker {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            handler,
            reply,
        })?;
        rx.await.map_err(|_| DispatchError::SchedulerShutdown)
    }

    /// Deregister a worker. Tasks it is already executing run to completion.
    /// Returns whether the worker was registered.
    pub async fn deregister_worker(&self, id: impl Into<String>) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DeregisterWorker {
            id: id.into(),
            reply,
        })?;
        rx.await.map_err(|_| DispatchError::SchedulerShutdown)
    }

    /// Submit a task. Fails fast when the priority is out of range or no
    /// registered worker carries the capability tag.
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        priority: u8,
        params: Map<String, Value>,
    ) -> Result<TaskId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            task_type: task_type.into(),
            priority,
            params,
            reply,
        })?;
        rx.await.map_err(|_| DispatchError::SchedulerShutdown)?
    }

    /// Submit a task and suspend until its terminal completion.
    pub async fn submit_and_wait(
        &self,
        task_type: impl Into<String>,
        priority: u8,
        params: Map<String, Value>,
    ) -> Result<Value> {
        let task_id = self.submit(task_type, priority, params).await?;
        match self.wait(task_id).await? {
            Ok(value) => Ok(value),
            Err(failure) => Err(DispatchError::HandlerFailed(failure)),
        }
    }

    /// Current lifecycle status of a task.
    pub fn status(&self, task_id: TaskId) -> Result<TaskStatus> {
        self.records
            .get(&task_id)
            .map(|record| record.status)
            .ok_or(DispatchError::TaskNotFound {
                task_id: task_id.as_uuid(),
            })
    }

    /// Terminal result of a task, if it has one yet.
    pub fn result(&self, task_id: TaskId) -> Result<Option<std::result::Result<Value, TaskFailure>>> {
        self.records
            .get(&task_id)
            .map(|record| record.result.clone())
            .ok_or(DispatchError::TaskNotFound {
                task_id: task_id.as_uuid(),
            })
    }

    /// Drop the records of tasks that have reached a terminal state,
    /// releasing their stored results. Status and result lookups for purged
    /// tasks report `TaskNotFound`, so retention after completion is the
    /// caller's call — a long-lived scheduler should purge periodically once
    /// results have been consumed.
    pub fn purge_finished(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.result.is_none());
        before.saturating_sub(self.records.len())
    }

    /// Suspend until the task reaches a terminal state.
    ///
    /// A preempted-and-requeued task is not reported here until it truly
    /// finishes or the scheduler shuts down.
    pub async fn wait(&self, task_id: TaskId) -> Result<std::result::Result<Value, TaskFailure>> {
        loop {
            let notify = {
                let record =
                    self.records
                        .get(&task_id)
                        .ok_or(DispatchError::TaskNotFound {
                            task_id: task_id.as_uuid(),
                        })?;
                if let Some(result) = &record.result {
                    return Ok(result.clone());
                }
                record.notify.clone()
            };

            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();

            // Re-check: the result may have landed before we registered
            if let Some(record) = self.records.get(&task_id) {
                if let Some(result) = &record.result {
                    return Ok(result.clone());
                }
            }

            notified.await;
        }
    }

    /// Snapshot of queue depth, running count, and per-worker load.
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| DispatchError::SchedulerShutdown)
    }

    /// Stop intake, fail all queued tasks, and wait for running tasks to
    /// finish.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| DispatchError::SchedulerShutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| DispatchError::SchedulerShutdown)
    }
}

struct Coordinator {
    config: SchedulerConfig,
    workers: WorkerTable,
    queue: BinaryHeap<QueuedTask>,
    running: HashMap<TaskId, RunningTask>,
    records: Arc<DashMap<TaskId, TaskRecord>>,
    tx: mpsc::UnboundedSender<Command>,
    metrics: Arc<dyn MetricsSink>,
    next_seq: u64,
    next_dispatch_seq: u64,
    shutting_down: bool,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Submit {
                    task_type,
                    priority,
                    params,
                    reply,
                } => {
                    let _ = reply.send(self.handle_submit(task_type, priority, params));
                }
                Command::RegisterWorker {
                    id,
                    capabilities,
                    handler,
                    reply,
                } => {
                    self.workers.register(id, capabilities, handler);
                    let _ = reply.send(());
                    self.dispatch_ready();
                }
                Command::DeregisterWorker { id, reply } => {
                    let _ = reply.send(self.workers.deregister(&id));
                }
                Command::Finished {
                    task_id,
                    worker_id,
                    outcome,
                    elapsed,
                } => {
                    self.handle_finished(task_id, worker_id, outcome, elapsed);
                    if self.drained() {
                        break;
                    }
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(SchedulerSnapshot {
                        queued: self.queue.len(),
                        running: self.running.len(),
                        workers: self.workers.snapshot(),
                    });
                }
                Command::Shutdown { reply } => {
                    self.begin_shutdown(reply);
                    if self.drained() {
                        break;
                    }
                }
            }
        }
        info!("task scheduler stopped");
    }

    fn handle_submit(
        &mut self,
        task_type: String,
        priority: u8,
        params: Map<String, Value>,
    ) -> Result<TaskId> {
        if self.shutting_down {
            return Err(DispatchError::SchedulerShutdown);
        }
        if !(1..=10).contains(&priority) {
            return Err(DispatchError::InvalidPriority { priority });
        }
        // No queuing for capability gaps: fail at the door
        if !self.workers.any_capable(&task_type) {
            return Err(DispatchError::NoCapableWorker { task_type });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let task = Task {
            id: TaskId::new(),
            task_type,
            priority,
            params,
            submitted_at: Utc::now(),
            seq,
        };
        let task_id = task.id;

        debug!(
            task_id = %task_id,
            task_type = %task.task_type,
            priority = priority,
            seq = seq,
            "task submitted"
        );

        self.records.insert(task_id, TaskRecord::pending());
        self.queue.push(QueuedTask { task });
        self.maybe_preempt(priority);
        self.dispatch_ready();
        Ok(task_id)
    }

    /// Signal exactly one lowest-priority running task when a high-priority
    /// arrival finds every slot held by strictly lower-priority work.
    fn maybe_preempt(&mut self, incoming_priority: u8) {
        if incoming_priority < self.config.preemption_threshold {
            return;
        }
        if self.running.len() < self.config.max_concurrent {
            return;
        }
        if self
            .running
            .values()
            .any(|r| r.priority >= incoming_priority)
        {
            return;
        }

        // Victim: lowest priority; among equals the most recently dispatched
        let victim = self
            .running
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.dispatch_seq.cmp(&a.dispatch_seq))
            })
            .map(|(id, r)| (*id, r.priority, r.token.clone()));

        if let Some((task_id, victim_priority, token)) = victim {
            info!(
                task_id = %task_id,
                victim_priority = victim_priority,
                incoming_priority = incoming_priority,
                "signalling preemption"
            );
            token.cancel();
        }
    }

    /// Dispatch waiting tasks while slots are free, highest priority first.
    fn dispatch_ready(&mut self) {
        while self.running.len() < self.config.max_concurrent {
            let Some(QueuedTask { task }) = self.queue.pop() else {
                break;
            };

            let Some((worker_id, handler)) = self.workers.select_with_handler(&task.task_type)
            else {
                // The capability existed at submission but its workers left
                warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    "no capable worker remains for queued task"
                );
                self.finish_task(
                    task.id,
                    Err(DispatchError::NoCapableWorker {
                        task_type: task.task_type.clone(),
                    }
                    .into_task_failure()),
                );
                continue;
            };

            self.workers.record_dispatch(&worker_id);
            let token = PreemptionToken::new();
            let dispatch_seq = self.next_dispatch_seq;
            self.next_dispatch_seq += 1;
            self.running.insert(
                task.id,
                RunningTask {
                    priority: task.priority,
                    token: token.clone(),
                    dispatch_seq,
                },
            );
            self.set_status(task.id, TaskStatus::Running);

            debug!(
                task_id = %task.id,
                worker_id = %worker_id,
                priority = task.priority,
                "task dispatched"
            );

            let tx = self.tx.clone();
            tokio::spawn(async move {
                let task_id = task.id;
                let started = Instant::now();
                let result = handler.handle(&task.params, &token).await;
                let elapsed = started.elapsed();

                let outcome = match result {
                    Ok(value) => TaskOutcome::Completed(value),
                    Err(failure) if failure.is_cancellation() && token.is_cancelled() => {
                        TaskOutcome::Preempted(task)
                    }
                    Err(failure) => TaskOutcome::Failed(failure),
                };
                let _ = tx.send(Command::Finished {
                    task_id,
                    worker_id,
                    outcome,
                    elapsed,
                });
            });
        }
    }

    fn handle_finished(
        &mut self,
        task_id: TaskId,
        worker_id: String,
        outcome: TaskOutcome,
        elapsed: Duration,
    ) {
        self.running.remove(&task_id);

        match outcome {
            TaskOutcome::Completed(value) => {
                self.workers.record_completion(&worker_id, Some(elapsed));
                self.metrics
                    .record_task_completion(&worker_id, elapsed, true);
                self.finish_task(task_id, Ok(value));
            }
            TaskOutcome::Failed(failure) => {
                self.workers.record_completion(&worker_id, Some(elapsed));
                self.metrics
                    .record_task_completion(&worker_id, elapsed, false);
                self.finish_task(task_id, Err(failure));
            }
            TaskOutcome::Preempted(task) => {
                // Load drops, but an interrupted run does not feed the EWMA
                self.workers.record_completion(&worker_id, None);
                if self.shutting_down {
                    self.finish_task(
                        task_id,
                        Err(DispatchError::SchedulerShutdown.into_task_failure()),
                    );
                } else {
                    info!(task_id = %task_id, "preempted task re-queued at original priority");
                    self.set_status(task_id, TaskStatus::Pending);
                    self.queue.push(QueuedTask { task });
                }
            }
        }

        self.dispatch_ready();
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        info!(
            queued = self.queue.len(),
            running = self.running.len(),
            "scheduler shutting down"
        );
        self.shutting_down = true;
        self.shutdown_reply = Some(reply);

        // Queued tasks never ran; fail them so waiters are released
        while let Some(QueuedTask { task }) = self.queue.pop() {
            self.finish_task(
                task.id,
                Err(DispatchError::SchedulerShutdown.into_task_failure()),
            );
        }
    }

    /// True once shutdown was requested and the last running task reported.
    fn drained(&mut self) -> bool {
        if self.shutting_down && self.running.is_empty() {
            if let Some(reply) = self.shutdown_reply.take() {
                let _ = reply.send(());
            }
            true
        } else {
            false
        }
    }

    fn set_status(&self, task_id: TaskId, status: TaskStatus) {
        if let Some(mut record) = self.records.get_mut(&task_id) {
            record.status = status;
        }
    }

    fn finish_task(&self, task_id: TaskId, result: std::result::Result<Value, TaskFailure>) {
        let notify = {
            let Some(mut record) = self.records.get_mut(&task_id) else {
                return;
            };
            record.status = if result.is_ok() {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            record.result = Some(result);
            record.notify.clone()
        };
        notify.notify_waiters();
    }
}
