//! # Retry Executor
//!
//! Executes operations against unreliable dependencies, retrying transient
//! failures with exponential backoff under a per-service [`RetryPolicy`].
//! Every attempt first consults the dependency's circuit breaker: an open
//! circuit fails fast without consuming an attempt or sleeping.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::classification::{self, ErrorCategory};
use crate::config::{RetryConfig, RetryPolicyConfig};
use crate::error::{DispatchError, Result, ServiceError};
use crate::metrics::MetricsSink;
use crate::resilience::{CircuitBreakerError, CircuitBreakerRegistry};

/// Resolved retry policy for one dependency.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub retryable: HashSet<ErrorCategory>,
}

impl RetryPolicy {
    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        self.retryable.contains(&category)
    }

    /// Backoff before the retry that follows `attempt` (1-based).
    ///
    /// Attempt 1 maps to the initial backoff; each later attempt multiplies
    /// it, capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let backoff = self
            .initial_backoff
            .mul_f64(self.backoff_multiplier.powi(exponent));
        backoff.min(self.max_backoff)
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff(),
            backoff_multiplier: config.backoff_multiplier,
            max_backoff: config.max_backoff(),
            retryable: config.retryable.clone(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryPolicyConfig::default())
    }
}

/// Resilient-execution wrapper around calls to external dependencies.
pub struct RetryExecutor {
    config: RetryConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<dyn MetricsSink>,
}

impl RetryExecutor {
    pub fn new(
        config: RetryConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            breakers,
            metrics,
        }
    }

    /// Policy in effect for `service` (default fallback when unregistered).
    pub fn policy_for(&self, service: &str) -> RetryPolicy {
        RetryPolicy::from(self.config.policy_for(service))
    }

    /// Execute `operation` against `service` with retry and circuit breaking.
    ///
    /// The operation is re-invoked for each attempt. Failures are classified
    /// before the retry decision; non-retryable categories surface
    /// immediately as [`DispatchError::NonRetryable`], exhausted retries as
    /// [`DispatchError::RetryExhausted`] wrapping the last cause.
    pub async fn run<T, F, Fut>(&self, service: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ServiceError>>,
    {
        let policy = self.policy_for(service);
        let breaker = self.breakers.breaker(service);
        let mut attempt: u32 = 1;

        loop {
            match breaker.call(&mut operation).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(service = %service, attempt = attempt, "operation recovered");
                    }
                    return Ok(value);
                }
                Err(CircuitBreakerError::CircuitOpen { service }) => {
                    // Fail fast: no attempt consumed, no sleep
                    warn!(service = %service, "call rejected, circuit open");
                    return Err(DispatchError::CircuitOpen { service });
                }
                Err(CircuitBreakerError::OperationFailed(cause)) => {
                    let category = classification::classify(&cause);
                    let code = classification::error_code(service, category);
                    self.metrics.record_error(code);

                    if !policy.is_retryable(category) {
                        error!(
                            service = %service,
                            code = %code,
                            category = %category,
                            error = %cause,
                            "non-retryable failure"
                        );
                        return Err(DispatchError::NonRetryable {
                            service: service.to_string(),
                            category,
                            source: cause,
                        });
                    }

                    if attempt >= policy.max_attempts {
                        error!(
                            service = %service,
                            code = %code,
                            category = %category,
                            attempts = attempt,
                            error = %cause,
                            "retries exhausted"
                        );
                        return Err(DispatchError::RetryExhausted {
                            service: service.to_string(),
                            attempts: attempt,
                            source: cause,
                        });
                    }

                    let backoff = policy.backoff_for_attempt(attempt);
                    warn!(
                        service = %service,
                        code = %code,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    self.metrics.record_retry(service);
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
