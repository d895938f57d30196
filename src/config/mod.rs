//! # Configuration Management
//!
//! Typed configuration for the scheduler, retry policies, and circuit
//! breakers. Components receive their config structs at construction time
//! (dependency injection, no global singletons), so several independently
//! tuned schedulers can coexist in one process.
//!
//! Defaults mirror the documented tunables: a bounded pool of 4 concurrent
//! tasks, preemption at priority 8, three retry attempts starting at 100ms
//! with a 2.0 multiplier capped at 1000ms, and breakers tripping at a 50%
//! failure rate over a 60s window with a 5s sleep window.

pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::classification::ErrorCategory;
use crate::error::{DispatchError, Result};

pub use loader::ConfigLoader;

/// Top-level configuration for one dispatch core instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DispatchConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub circuit_breakers: CircuitBreakerSettings,
}

impl DispatchConfig {
    /// Validate ranges across all sections.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.retry.default.validate("retry.default")?;
        for (service, policy) in &self.retry.services {
            policy.validate(&format!("retry.services.{service}"))?;
        }
        self.circuit_breakers
            .default
            .validate("circuit_breakers.default")?;
        for (service, cb) in &self.circuit_breakers.services {
            cb.validate(&format!("circuit_breakers.services.{service}"))?;
        }
        Ok(())
    }
}

/// Scheduler tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks executing simultaneously
    pub max_concurrent: usize,
    /// Minimum priority that may trigger preemption of running work
    pub preemption_threshold: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            preemption_threshold: 8,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(DispatchError::Configuration(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if !(1..=10).contains(&self.preemption_threshold) {
            return Err(DispatchError::Configuration(format!(
                "scheduler.preemption_threshold must be within 1..=10, got {}",
                self.preemption_threshold
            )));
        }
        Ok(())
    }
}

/// Retry policy for one dependency/service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Failure categories eligible for retry
    pub retryable: HashSet<ErrorCategory>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
            retryable: HashSet::from([
                ErrorCategory::ConnectionFailure,
                ErrorCategory::QueryTimeout,
            ]),
        }
    }
}

impl RetryPolicyConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DispatchError::Configuration(format!(
                "{section}.max_attempts must be at least 1"
            )));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(DispatchError::Configuration(format!(
                "{section}.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(DispatchError::Configuration(format!(
                "{section}.max_backoff_ms must be >= initial_backoff_ms"
            )));
        }
        Ok(())
    }
}

/// Retry policies: a default plus per-service overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RetryConfig {
    pub default: RetryPolicyConfig,
    pub services: HashMap<String, RetryPolicyConfig>,
}

impl RetryConfig {
    /// Policy for `service`, falling back to the default policy.
    pub fn policy_for(&self, service: &str) -> &RetryPolicyConfig {
        self.services.get(service).unwrap_or(&self.default)
    }
}

/// Circuit breaker thresholds for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure-rate percentage (0-100) that opens the circuit
    pub threshold_percentage: f64,
    /// Minimum requests in the window before the threshold is evaluated
    pub min_request_count: u64,
    /// Rolling window length over which the failure rate is computed
    pub window_size_seconds: u64,
    /// Cooldown before an open circuit admits a recovery probe
    pub sleep_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold_percentage: 50.0,
            min_request_count: 20,
            window_size_seconds: 60,
            sleep_window_ms: 5000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn window_size(&self) -> Duration {
        Duration::from_secs(self.window_size_seconds)
    }

    pub fn sleep_window(&self) -> Duration {
        Duration::from_millis(self.sleep_window_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if !(0.0..=100.0).contains(&self.threshold_percentage) || self.threshold_percentage == 0.0 {
            return Err(DispatchError::Configuration(format!(
                "{section}.threshold_percentage must be within (0, 100], got {}",
                self.threshold_percentage
            )));
        }
        if self.min_request_count == 0 {
            return Err(DispatchError::Configuration(format!(
                "{section}.min_request_count must be at least 1"
            )));
        }
        if self.window_size_seconds == 0 {
            return Err(DispatchError::Configuration(format!(
                "{section}.window_size_seconds must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Circuit breaker settings: a default plus per-service overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub default: CircuitBreakerConfig,
    pub services: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerSettings {
    pub fn config_for(&self, service: &str) -> CircuitBreakerConfig {
        self.services
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
