//! # Resilience
//!
//! Fault tolerance around calls to unreliable external dependencies:
//! per-dependency circuit breakers and retry with exponential backoff.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dispatch_core::config::{CircuitBreakerSettings, RetryConfig};
//! use dispatch_core::metrics::TracingMetricsSink;
//! use dispatch_core::resilience::{CircuitBreakerRegistry, RetryExecutor};
//! use dispatch_core::ServiceError;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = Arc::new(TracingMetricsSink);
//! let breakers = Arc::new(CircuitBreakerRegistry::new(
//!     CircuitBreakerSettings::default(),
//!     metrics.clone(),
//! ));
//! let executor = RetryExecutor::new(RetryConfig::default(), breakers, metrics);
//!
//! let rows = executor
//!     .run("database", || async {
//!         // dependency call here
//!         Ok::<_, ServiceError>(vec!["row"])
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry, CircuitState,
};
pub use retry::{RetryExecutor, RetryPolicy};
