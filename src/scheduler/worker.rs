//! Worker registry and selection.
//!
//! The table is owned exclusively by the scheduler's coordinator loop, so
//! load counters and latency averages are never read mid-update during
//! selection.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::task::TaskHandler;

/// EWMA smoothing factor for per-worker latency tracking.
const EWMA_ALPHA: f64 = 0.2;

/// Public view of one worker's registration and load.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub capabilities: HashSet<String>,
    pub current_load: u32,
    pub avg_response_time_ms: f64,
}

struct WorkerEntry {
    capabilities: HashSet<String>,
    handler: Arc<dyn TaskHandler>,
    current_load: u32,
    avg_response_time_ms: f64,
    completions: u64,
}

/// Capability-indexed worker table.
#[derive(Default)]
pub(crate) struct WorkerTable {
    workers: HashMap<String, WorkerEntry>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. Re-registering an id replaces its entry.
    pub fn register(
        &mut self,
        id: String,
        capabilities: HashSet<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        if self.workers.contains_key(&id) {
            warn!(worker_id = %id, "worker already registered, replacing");
        }
        info!(worker_id = %id, capabilities = ?capabilities, "worker registered");
        self.workers.insert(
            id,
            WorkerEntry {
                capabilities,
                handler,
                current_load: 0,
                avg_response_time_ms: 0.0,
                completions: 0,
            },
        );
    }

    /// Remove a worker. Tasks already dispatched to it run to completion.
    pub fn deregister(&mut self, id: &str) -> bool {
        let removed = self.workers.remove(id).is_some();
        if removed {
            info!(worker_id = %id, "worker deregistered");
        }
        removed
    }

    /// Whether any registered worker carries the capability tag.
    pub fn any_capable(&self, task_type: &str) -> bool {
        self.workers
            .values()
            .any(|w| w.capabilities.contains(task_type))
    }

    /// Pick the eligible worker for `task_type`: lowest current load, ties
    /// broken by lowest average response time, then by id for determinism.
    pub fn select(&self, task_type: &str) -> Option<&str> {
        self.workers
            .iter()
            .filter(|(_, w)| w.capabilities.contains(task_type))
            .min_by(|(a_id, a), (b_id, b)| {
                a.current_load
                    .cmp(&b.current_load)
                    .then(a.avg_response_time_ms.total_cmp(&b.avg_response_time_ms))
                    .then(a_id.cmp(b_id))
            })
            .map(|(id, _)| id.as_str())
    }

    pub fn handler(&self, id: &str) -> Option<Arc<dyn TaskHandler>> {
        self.workers.get(id).map(|w| w.handler.clone())
    }

    /// Selection plus handler lookup in one step, for dispatch.
    pub fn select_with_handler(&self, task_type: &str) -> Option<(String, Arc<dyn TaskHandler>)> {
        let id = self.select(task_type)?.to_string();
        let handler = self.handler(&id)?;
        Some((id, handler))
    }

    /// Account for a dispatch: load +1.
    pub fn record_dispatch(&mut self, id: &str) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.current_load += 1;
        }
    }

    /// Account for a completion: load −1, and fold the observed latency into
    /// the EWMA when the task actually ran to a result.
    pub fn record_completion(&mut self, id: &str, duration: Option<Duration>) {
        let Some(worker) = self.workers.get_mut(id) else {
            // Deregistered while its task was in flight
            debug!(worker_id = %id, "completion for unregistered worker");
            return;
        };
        worker.current_load = worker.current_load.saturating_sub(1);

        if let Some(duration) = duration {
            let observed = duration.as_secs_f64() * 1000.0;
            worker.avg_response_time_ms = if worker.completions == 0 {
                observed
            } else {
                EWMA_ALPHA * observed + (1.0 - EWMA_ALPHA) * worker.avg_response_time_ms
            };
            worker.completions += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|(id, w)| WorkerInfo {
                id: id.clone(),
                capabilities: w.capabilities.clone(),
                current_load: w.current_load,
                avg_response_time_ms: w.avg_response_time_ms,
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
