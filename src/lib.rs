#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dispatch Core
//!
//! Task-dispatch and resilience layer coordinating work among autonomous
//! agent workers: a priority-aware scheduler with bounded concurrency and
//! cooperative preemption, a TTL result cache with single-flight coalescing,
//! and a resilient-execution wrapper (retry with exponential backoff plus
//! per-dependency circuit breaking) around calls to unreliable external
//! services.
//!
//! ## Module Organization
//!
//! - [`scheduler`] - Priority queue, bounded worker pool, preemption
//! - [`cache`] - TTL memoization with at-most-one concurrent build per key
//! - [`resilience`] - Retry executor and circuit breakers
//! - [`classification`] - Failure categories and service-scoped error codes
//! - [`config`] - Typed, environment-aware configuration
//! - [`metrics`] - Counter sink seam for telemetry backends
//! - [`error`] - Structured error handling
//! - [`logging`] - Tracing initialization
//!
//! ## Design
//!
//! Nothing here is a process-wide singleton: schedulers, caches, breaker
//! registries, and retry executors are explicitly constructed and
//! dependency-injected, so several independent instances can coexist in one
//! process and tests get deterministic setup.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dispatch_core::config::DispatchConfig;
//! use dispatch_core::metrics::TracingMetricsSink;
//! use dispatch_core::scheduler::TaskScheduler;
//! use std::sync::Arc;
//!
//! # async fn example(handler: Arc<dyn dispatch_core::scheduler::TaskHandler>) -> dispatch_core::Result<()> {
//! dispatch_core::logging::init_structured_logging();
//!
//! let config = DispatchConfig::default();
//! let scheduler = TaskScheduler::new(config.scheduler, Arc::new(TracingMetricsSink));
//! scheduler.register_worker("agent-1", ["search"], handler).await?;
//!
//! let task_id = scheduler.submit("search", 5, serde_json::Map::new()).await?;
//! let result = scheduler.wait(task_id).await?;
//! println!("task finished: {result:?}");
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod classification;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod scheduler;

pub use cache::ResultCache;
pub use classification::{classify, error_code, ErrorCategory};
pub use config::{ConfigLoader, DispatchConfig, SchedulerConfig};
pub use error::{DispatchError, Result, ServiceError, TaskFailure};
pub use metrics::{InMemoryMetricsSink, MetricsSink, TracingMetricsSink};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, RetryExecutor, RetryPolicy};
pub use scheduler::{
    PreemptionToken, SchedulerSnapshot, Task, TaskHandler, TaskId, TaskScheduler, TaskStatus,
};
