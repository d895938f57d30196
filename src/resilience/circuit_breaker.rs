//! # Circuit Breaker
//!
//! Per-dependency fault isolation with three states: Closed (normal
//! operation), Open (failing fast), and Half-Open (testing recovery).
//!
//! Failure rate is evaluated over a rolling window: while Closed, every
//! outcome bumps `request_count`/`failure_count`, and once the window holds
//! at least `min_request_count` requests with a failure percentage at or
//! above `threshold_percentage` the circuit opens. The window slides — when
//! it outlives `window_size` the counters reset regardless of threshold.
//! An open circuit rejects every call until `sleep_window` elapses, then
//! admits exactly one probe: success closes the circuit with fresh counters,
//! failure re-opens it and restarts the cooldown. Only the probe's own
//! outcome decides the half-open transition, and a probe whose future is
//! dropped before resolving releases the slot so the next call may retry
//! recovery.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{CircuitBreakerConfig, CircuitBreakerSettings};
use crate::metrics::MetricsSink;

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - a single probe call is allowed through
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            // Default to the safest state
            _ => CircuitState::Open,
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("circuit breaker is open for {service}")]
    CircuitOpen { service: String },

    /// Operation executed and failed; the outcome was recorded
    #[error("operation failed: {0}")]
    OperationFailed(E),
}

/// Rolling-window counters, protected by a mutex.
#[derive(Debug)]
struct BreakerWindow {
    window_start: Instant,
    request_count: u64,
    failure_count: u64,
    opened_at: Option<Instant>,
}

impl BreakerWindow {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            request_count: 0,
            failure_count: 0,
            opened_at: None,
        }
    }
}

/// Admission ticket for one call; `probe` marks the half-open recovery probe.
struct CallPermit {
    probe: bool,
}

/// Releases the probe slot if an admitted probe is dropped before its
/// outcome is recorded, so an abandoned probe cannot wedge the breaker in
/// half-open.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                service = %self.breaker.service,
                "recovery probe abandoned before completion"
            );
            self.breaker.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Core circuit breaker implementation with atomic state management.
pub struct CircuitBreaker {
    /// Dependency name for logging and metrics
    service: String,

    /// Current circuit state (atomic for cheap reads)
    state: AtomicU8,

    /// Configuration parameters
    config: CircuitBreakerConfig,

    /// Rolling window counters
    window: Mutex<BreakerWindow>,

    /// Whether the single half-open recovery probe is currently admitted
    probe_in_flight: AtomicBool,

    /// Metrics sink notified on every transition
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named dependency.
    pub fn new(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let service = service.into();
        info!(
            service = %service,
            threshold_percentage = config.threshold_percentage,
            min_request_count = config.min_request_count,
            window_seconds = config.window_size_seconds,
            sleep_window_ms = config.sleep_window_ms,
            "circuit breaker initialized"
        );

        Self {
            service,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            window: Mutex::new(BreakerWindow::new()),
            probe_in_flight: AtomicBool::new(false),
            metrics,
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Get the dependency name
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Rejects immediately with [`CircuitBreakerError::CircuitOpen`] when the
    /// circuit is open and the cooldown has not elapsed; otherwise runs the
    /// operation and records the outcome against the rolling window.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.acquire_permit().await else {
            return Err(CircuitBreakerError::CircuitOpen {
                service: self.service.clone(),
            });
        };

        let mut probe_guard = permit.probe.then(|| ProbeGuard {
            breaker: self,
            armed: true,
        });

        let result = operation().await;

        if let Some(guard) = probe_guard.as_mut() {
            guard.armed = false;
        }
        match &result {
            Ok(_) => self.record_success(permit.probe).await,
            Err(_) => self.record_failure(permit.probe).await,
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Check whether a call may proceed, performing any due transition.
    /// The permit marks whether this call is the half-open recovery probe.
    async fn acquire_permit(&self) -> Option<CallPermit> {
        match self.state() {
            CircuitState::Closed => {
                let mut window = self.window.lock().await;
                self.slide_window_if_stale(&mut window);
                Some(CallPermit { probe: false })
            }
            CircuitState::Open => {
                let mut window = self.window.lock().await;
                match window.opened_at {
                    Some(opened_at) if opened_at.elapsed() >= self.config.sleep_window() => {
                        self.transition_to_half_open(&mut window);
                        self.probe_in_flight.store(true, Ordering::Release);
                        Some(CallPermit { probe: true })
                    }
                    Some(_) => None,
                    None => {
                        // Open without a timestamp should not happen; fail safe
                        warn!(service = %self.service, "circuit open without opened_at timestamp");
                        None
                    }
                }
            }
            CircuitState::HalfOpen => self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                .then_some(CallPermit { probe: true }),
        }
    }

    /// Record a successful operation
    async fn record_success(&self, probe: bool) {
        let mut window = self.window.lock().await;
        if probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }

        match self.state() {
            CircuitState::Closed => {
                self.slide_window_if_stale(&mut window);
                window.request_count += 1;
                debug!(service = %self.service, "operation succeeded");
                // The threshold can be crossed by the request count reaching
                // the minimum while the failure rate already qualifies
                self.trip_if_over_threshold(&mut window);
            }
            CircuitState::HalfOpen if probe => {
                info!(service = %self.service, "recovery probe succeeded");
                self.transition_to_closed(&mut window);
            }
            CircuitState::HalfOpen => {
                // Late outcome of a call admitted before the circuit opened
                debug!(service = %self.service, "late success ignored while probing recovery");
            }
            CircuitState::Open => {
                // A call admitted just before the circuit opened; count nothing
                debug!(service = %self.service, "success recorded while circuit is open");
            }
        }
    }

    /// Record a failed operation
    async fn record_failure(&self, probe: bool) {
        let mut window = self.window.lock().await;
        if probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }

        match self.state() {
            CircuitState::Closed => {
                self.slide_window_if_stale(&mut window);
                window.request_count += 1;
                window.failure_count += 1;
                self.trip_if_over_threshold(&mut window);
            }
            CircuitState::HalfOpen if probe => {
                warn!(service = %self.service, "recovery probe failed");
                self.transition_to_open(&mut window);
            }
            CircuitState::HalfOpen => {
                debug!(service = %self.service, "late failure ignored while probing recovery");
            }
            CircuitState::Open => {
                debug!(service = %self.service, "failure recorded while circuit is open");
            }
        }
    }

    /// Open the circuit when the window qualifies and the failure rate is at
    /// or over the threshold.
    fn trip_if_over_threshold(&self, window: &mut BreakerWindow) {
        if window.request_count < self.config.min_request_count {
            return;
        }
        let failure_rate = window.failure_count as f64 / window.request_count as f64 * 100.0;
        if failure_rate >= self.config.threshold_percentage {
            error!(
                service = %self.service,
                request_count = window.request_count,
                failure_count = window.failure_count,
                failure_rate = failure_rate,
                "failure rate over threshold"
            );
            self.transition_to_open(window);
        }
    }

    /// Reset the rolling window when it has outlived its size.
    fn slide_window_if_stale(&self, window: &mut BreakerWindow) {
        if window.window_start.elapsed() > self.config.window_size() {
            window.window_start = Instant::now();
            window.request_count = 0;
            window.failure_count = 0;
        }
    }

    /// Transition to closed state (normal operation)
    fn transition_to_closed(&self, window: &mut BreakerWindow) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        window.window_start = Instant::now();
        window.request_count = 0;
        window.failure_count = 0;
        window.opened_at = None;
        self.probe_in_flight.store(false, Ordering::Release);

        info!(service = %self.service, "circuit breaker closed (recovered)");
        self.metrics
            .record_circuit_transition(&self.service, CircuitState::Closed);
    }

    /// Transition to open state (failing fast)
    fn transition_to_open(&self, window: &mut BreakerWindow) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        window.opened_at = Some(Instant::now());
        self.probe_in_flight.store(false, Ordering::Release);

        error!(
            service = %self.service,
            sleep_window_ms = self.config.sleep_window_ms,
            "circuit breaker opened (failing fast)"
        );
        self.metrics
            .record_circuit_transition(&self.service, CircuitState::Open);
    }

    /// Transition to half-open state (testing recovery)
    fn transition_to_half_open(&self, _window: &mut BreakerWindow) {
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);

        info!(service = %self.service, "circuit breaker half-open (testing recovery)");
        self.metrics
            .record_circuit_transition(&self.service, CircuitState::HalfOpen);
    }

    /// Force circuit to open state (for emergency situations)
    pub async fn force_open(&self) {
        warn!(service = %self.service, "circuit breaker forced open");
        let mut window = self.window.lock().await;
        self.transition_to_open(&mut window);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub async fn force_closed(&self) {
        warn!(service = %self.service, "circuit breaker forced closed");
        let mut window = self.window.lock().await;
        self.transition_to_closed(&mut window);
    }

    /// Current (request, failure) counts in the rolling window.
    pub async fn window_counts(&self) -> (u64, u64) {
        let window = self.window.lock().await;
        (window.request_count, window.failure_count)
    }
}

/// Registry of circuit breakers, one per logical dependency name.
///
/// Breakers are created lazily from [`CircuitBreakerSettings`] so every
/// caller targeting the same dependency shares one instance.
pub struct CircuitBreakerRegistry {
    breakers: dashmap::DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            breakers: dashmap::DashMap::new(),
            settings,
            metrics,
        }
    }

    /// Get or lazily create the breaker for `service`.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.settings.config_for(service),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    /// Names of all breakers created so far.
    pub fn services(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{InMemoryMetricsSink, TracingMetricsSink};
    use std::time::Duration;
    use tokio::time::sleep;

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold_percentage: 50.0,
            min_request_count: 4,
            window_size_seconds: 60,
            sleep_window_ms: 50,
        }
    }

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("test", config, Arc::new(TracingMetricsSink))
    }

    #[tokio::test]
    async fn normal_operation_stays_closed() {
        let circuit = breaker(quick_config());
        assert_eq!(circuit.state(), CircuitState::Closed);

        for _ in 0..10 {
            let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
            assert!(result.is_ok());
        }
        assert_eq!(circuit.state(), CircuitState::Closed);

        let (requests, failures) = circuit.window_counts().await;
        assert_eq!(requests, 10);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn opens_when_failure_rate_crosses_threshold() {
        let circuit = breaker(quick_config());

        // 2 successes + 2 failures: 50% of 4 requests meets the threshold
        for _ in 0..2 {
            let _ = circuit.call(|| async { Ok::<_, String>("ok") }).await;
        }
        let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        // The very next call is rejected without executing
        let result = circuit
            .call(|| async {
                panic!("must not execute");
                #[allow(unreachable_code)]
                Ok::<_, String>("unreachable")
            })
            .await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn below_min_request_count_never_opens() {
        let mut config = quick_config();
        config.min_request_count = 10;
        let circuit = breaker(config);

        for _ in 0..9 {
            let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_with_reset_counters() {
        let circuit = breaker(quick_config());

        for _ in 0..4 {
            let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;

        let result = circuit.call(|| async { Ok::<_, String>("recovered") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);

        let (requests, failures) = circuit.window_counts().await;
        assert_eq!(requests, 0);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let circuit = breaker(quick_config());

        for _ in 0..4 {
            let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        }
        sleep(Duration::from_millis(60)).await;

        let _ = circuit.call(|| async { Err::<String, _>("still broken") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        // Cooldown restarted: an immediate call is rejected again
        let result = circuit.call(|| async { Ok::<_, String>("nope") }).await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn abandoned_probe_releases_the_probe_slot() {
        let mut config = quick_config();
        config.min_request_count = 2;
        let circuit = breaker(config);

        for _ in 0..2 {
            let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);
        sleep(Duration::from_millis(60)).await;

        // The admitted probe is dropped before it resolves
        let abandoned = circuit.call(|| async {
            sleep(Duration::from_secs(5)).await;
            Ok::<_, String>("never")
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), abandoned)
            .await
            .is_err());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // The slot is free again: the next call probes and closes the circuit
        let result = circuit.call(|| async { Ok::<_, String>("recovered") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn late_result_from_before_opening_is_not_the_probe_outcome() {
        let mut config = quick_config();
        config.min_request_count = 2;
        let circuit = Arc::new(breaker(config));

        // Admitted while closed, resolves long after the circuit opens
        let slow = {
            let circuit = circuit.clone();
            tokio::spawn(async move {
                circuit
                    .call(|| async {
                        sleep(Duration::from_millis(120)).await;
                        Ok::<_, String>("slow")
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;

        for _ in 0..2 {
            let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);
        sleep(Duration::from_millis(60)).await;

        let probe = {
            let circuit = circuit.clone();
            tokio::spawn(async move {
                circuit
                    .call(|| async {
                        sleep(Duration::from_millis(100)).await;
                        Err::<String, _>("still broken")
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(20)).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // The pre-open call succeeding must not close the circuit
        assert!(slow.await.expect("join").is_ok());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // Only the probe's outcome decides: its failure re-opens
        assert!(probe.await.expect("join").is_err());
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn sliding_window_resets_counters() {
        let mut config = quick_config();
        config.window_size_seconds = 1;
        let circuit = breaker(config);

        let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        let (requests, _) = circuit.window_counts().await;
        assert_eq!(requests, 1);

        sleep(Duration::from_millis(1100)).await;

        let _ = circuit.call(|| async { Ok::<_, String>("ok") }).await;
        let (requests, failures) = circuit.window_counts().await;
        assert_eq!(requests, 1);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn force_operations_override_state() {
        let circuit = breaker(quick_config());

        circuit.force_open().await;
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_closed().await;
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_shares_one_breaker_per_service() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerSettings::default(),
            Arc::new(TracingMetricsSink),
        );
        let a = registry.breaker("database");
        let b = registry.breaker("database");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.services(), vec!["database".to_string()]);
    }

    #[tokio::test]
    async fn transitions_are_reported_to_metrics() {
        let sink = Arc::new(InMemoryMetricsSink::new());
        let circuit = CircuitBreaker::new("database", quick_config(), sink.clone());

        for _ in 0..4 {
            let _ = circuit.call(|| async { Err::<String, _>("boom") }).await;
        }
        assert_eq!(sink.circuit_state("database"), Some(CircuitState::Open));
    }
}
