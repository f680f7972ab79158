// src/resilience/circuit_breaker.rs
//! Per-task-kind circuit breakers
//!
//! A breaker stops issuing attempts for a repeatedly failing task kind:
//!
//! - `closed → open` after `failure_threshold` consecutive failures
//! - `open → half-open` once `timeout` has elapsed since opening
//! - `half-open → closed` after `success_threshold` consecutive successes
//! - `half-open → open` on any failure
//!
//! While half-open, exactly one probe attempt is admitted at a time.
//! Breakers are created lazily per kind and live for the process lifetime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::utils::errors::{EngineError, Result};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Consecutive successes that close a half-open circuit
    pub success_threshold: u32,

    /// Cooldown before a half-open probe is allowed
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Counters exposed for observability
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    metrics: CircuitMetrics,
}

/// One breaker, keyed by task kind
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: parking_lot::Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: parking_lot::Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
                metrics: CircuitMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask permission to issue one attempt
    ///
    /// Open circuits reject until the cooldown elapses, then admit a single
    /// half-open probe.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.metrics.total_requests += 1;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout {
                    debug!(breaker = %self.name, "cooldown elapsed, moving to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(EngineError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.metrics.successful_requests += 1;
        inner.metrics.last_success_time = Some(Instant::now());
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;

        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                debug!(breaker = %self.name, "closing circuit");
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.metrics.failed_requests += 1;
        inner.metrics.last_failure_time = Some(Instant::now());
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            // A half-open probe failing reopens immediately.
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            self.open_locked(&mut inner);
        }
    }

    /// Open the circuit unconditionally (policy-driven trigger)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            self.open_locked(&mut inner);
        }
    }

    fn open_locked(&self, inner: &mut BreakerState) {
        warn!(
            breaker = %self.name,
            consecutive_failures = inner.consecutive_failures,
            "opening circuit"
        );
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        metrics::counter!("foreman_circuit_opened_total").increment(1);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        self.inner.lock().metrics.clone()
    }
}

/// Lazily-populated registry of breakers, one per task kind
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Get or create the breaker for a task kind
    pub fn breaker(&self, kind: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(kind.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(kind, self.config.clone())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 2,
                timeout,
            },
        )
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let breaker = breaker(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_interleaved_success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Probe in flight: concurrent acquirers are rejected.
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        breaker.try_acquire().unwrap();

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_closes_after_success_threshold() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_force_open_wins_regardless_of_counts() {
        let breaker = breaker(100, Duration::from_secs(30));
        breaker.record_failure();
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_creates_lazily_per_kind() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        assert!(registry.is_empty());

        let issue = registry.breaker("issue");
        let spec = registry.breaker("spec");
        assert_eq!(registry.len(), 2);

        issue.record_failure();
        assert_eq!(issue.metrics().failed_requests, 1);
        assert_eq!(spec.metrics().failed_requests, 0);

        // Same kind returns the same instance.
        assert_eq!(registry.breaker("issue").metrics().failed_requests, 1);
    }
}
