// src/resilience/retry.rs
//! Retry policies and the resilience wrapper
//!
//! Wraps an "attempt a unit of work" future with retry semantics: backoff
//! with optional jitter, retryability matching on error text and exit codes,
//! and a per-task-kind circuit breaker consulted before every attempt. The
//! full attempt trail is returned so callers can distinguish "succeeded on
//! attempt 3" from "failed fast because the circuit was open".

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::utils::errors::EngineError;

/// Backoff growth curves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Linear,
    Fixed,
}

/// Backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Perturb the delay by ±10% to avoid synchronized retry storms
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Deterministic delay before the given attempt (1-indexed), pre-jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self.kind {
            BackoffKind::Exponential => {
                let exp = 1u64 << (attempt - 1).min(30);
                self.base_delay_ms.saturating_mul(exp)
            }
            BackoffKind::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            BackoffKind::Fixed => self.base_delay_ms,
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Delay with jitter applied when configured
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
        base.mul_f64(factor)
    }
}

/// Hook consulted on each failure: `(error message, attempts so far)`
pub type CircuitHook = Arc<dyn Fn(&str, u32) -> bool + Send + Sync>;

/// Retry policy for one kind of work
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,

    /// Substring matchers against failure messages. With no matchers
    /// configured (neither errors nor exit codes), every failure is
    /// considered retryable.
    pub retryable_errors: Vec<String>,

    /// Exit codes considered transient
    pub retryable_exit_codes: Vec<i32>,

    /// Optional policy-driven circuit trigger, independent of the breaker's
    /// own failure threshold; either trigger opens the circuit, first wins
    pub should_open_circuit: Option<CircuitHook>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            retryable_errors: vec![],
            retryable_exit_codes: vec![],
            should_open_circuit: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retryable_errors", &self.retryable_errors)
            .field("retryable_exit_codes", &self.retryable_exit_codes)
            .field("should_open_circuit", &self.should_open_circuit.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Whether a failure matches the retryable matchers
    pub fn matches_retryable(&self, failure: &AttemptFailure) -> bool {
        if self.retryable_errors.is_empty() && self.retryable_exit_codes.is_empty() {
            return true;
        }

        let message = failure.message.to_lowercase();
        if self
            .retryable_errors
            .iter()
            .any(|m| message.contains(&m.to_lowercase()))
        {
            return true;
        }
        failure
            .exit_code
            .is_some_and(|code| self.retryable_exit_codes.contains(&code))
    }
}

/// One failed attempt, as reported by the attempt function
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl AttemptFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code: Some(exit_code),
        }
    }
}

/// One retry iteration in the attempt trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// 1-indexed
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub will_retry: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Aggregated outcome of a resilient execution
#[derive(Debug, Clone)]
pub struct ResilientExecutionResult<T> {
    /// Present when some attempt succeeded
    pub value: Option<T>,

    pub attempts: Vec<ExecutionAttempt>,
    pub total_attempts: u32,
    pub failure_reason: Option<String>,

    /// True when no attempt was issued because the circuit was open
    pub circuit_breaker_triggered: bool,
}

impl<T> ResilientExecutionResult<T> {
    pub fn succeeded(&self) -> bool {
        self.value.is_some()
    }

    pub fn final_attempt(&self) -> Option<&ExecutionAttempt> {
        self.attempts.last()
    }
}

/// Wraps attempt functions with retry/backoff/circuit-breaker logic
pub struct ResilienceWrapper {
    policy: RetryPolicy,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ResilienceWrapper {
    pub fn new(policy: RetryPolicy, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { policy, breakers }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive one unit of work through the retry loop.
    ///
    /// `attempt` receives the 1-indexed attempt number and resolves to the
    /// work's outcome. Non-retryable failures fail immediately without
    /// consuming remaining attempts.
    pub async fn execute<T, F, Fut>(&self, kind: &str, mut attempt: F) -> ResilientExecutionResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptFailure>>,
    {
        let breaker = self.breakers.breaker(kind);
        let mut attempts: Vec<ExecutionAttempt> = Vec::new();

        for attempt_number in 1..=self.policy.max_attempts {
            if let Err(EngineError::CircuitOpen(name)) = breaker.try_acquire() {
                warn!(kind, attempt_number, "attempt rejected: circuit open");
                return ResilientExecutionResult {
                    value: None,
                    total_attempts: attempts.len() as u32,
                    attempts,
                    failure_reason: Some(format!("circuit breaker '{name}' is open")),
                    circuit_breaker_triggered: true,
                };
            }

            let started_at = Utc::now();
            let started = Instant::now();
            let outcome = attempt(attempt_number).await;
            let completed_at = Utc::now();
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    breaker.record_success();
                    attempts.push(ExecutionAttempt {
                        attempt_number,
                        started_at,
                        completed_at,
                        duration_ms,
                        success: true,
                        error: None,
                        exit_code: Some(0),
                        will_retry: false,
                        next_retry_at: None,
                    });
                    return ResilientExecutionResult {
                        value: Some(value),
                        total_attempts: attempts.len() as u32,
                        attempts,
                        failure_reason: None,
                        circuit_breaker_triggered: false,
                    };
                }
                Err(failure) => {
                    breaker.record_failure();
                    if let Some(hook) = &self.policy.should_open_circuit {
                        if hook(&failure.message, attempt_number) {
                            debug!(kind, "policy hook opened circuit");
                            breaker.force_open();
                        }
                    }

                    let will_retry = attempt_number < self.policy.max_attempts
                        && self.policy.matches_retryable(&failure);
                    let delay = will_retry.then(|| self.policy.backoff.jittered_delay(attempt_number));

                    attempts.push(ExecutionAttempt {
                        attempt_number,
                        started_at,
                        completed_at,
                        duration_ms,
                        success: false,
                        error: Some(failure.message.clone()),
                        exit_code: failure.exit_code,
                        will_retry,
                        next_retry_at: delay
                            .map(|d| Utc::now() + chrono::Duration::milliseconds(d.as_millis() as i64)),
                    });

                    if !will_retry {
                        debug!(kind, attempt_number, error = %failure.message, "failing without retry");
                        return ResilientExecutionResult {
                            value: None,
                            total_attempts: attempts.len() as u32,
                            attempts,
                            failure_reason: Some(failure.message),
                            circuit_breaker_triggered: false,
                        };
                    }

                    let delay = delay.unwrap_or_default();
                    debug!(kind, attempt_number, ?delay, "retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let failure_reason = attempts
            .last()
            .and_then(|a| a.error.clone())
            .unwrap_or_else(|| "retry attempts exhausted".to_string());
        ResilientExecutionResult {
            value: None,
            total_attempts: attempts.len() as u32,
            attempts,
            failure_reason: Some(failure_reason),
            circuit_breaker_triggered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreakerConfig;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn wrapper(policy: RetryPolicy) -> ResilienceWrapper {
        ResilienceWrapper::new(
            policy,
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        )
    }

    #[test]
    fn test_exponential_delay_with_cap() {
        let backoff = BackoffConfig {
            kind: BackoffKind::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            jitter: false,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(16000));
        // 1000 * 2^9 = 512000, capped.
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        let linear = BackoffConfig {
            kind: BackoffKind::Linear,
            base_delay_ms: 500,
            max_delay_ms: 10000,
            jitter: false,
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(1500));

        let fixed = BackoffConfig {
            kind: BackoffKind::Fixed,
            base_delay_ms: 750,
            max_delay_ms: 10000,
            jitter: false,
        };
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_millis(750));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let backoff = BackoffConfig {
            kind: BackoffKind::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            jitter: true,
        };
        for _ in 0..200 {
            let delay = backoff.jittered_delay(5).as_millis() as u64;
            assert!((14400..=17600).contains(&delay), "delay {delay} out of range");
        }
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(
            attempt in 1u32..64,
            base in 1u64..10_000,
            max in 1u64..60_000,
        ) {
            for kind in [BackoffKind::Exponential, BackoffKind::Linear, BackoffKind::Fixed] {
                let backoff = BackoffConfig {
                    kind,
                    base_delay_ms: base,
                    max_delay_ms: max,
                    jitter: false,
                };
                prop_assert!(backoff.delay_for_attempt(attempt).as_millis() as u64 <= max);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 4,
            retryable_errors: vec!["transient".to_string()],
            ..Default::default()
        };
        let calls = AtomicU32::new(0);

        let result = wrapper(policy)
            .execute("issue", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(AttemptFailure::new("transient glitch"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert!(result.succeeded());
        assert_eq!(result.value, Some(3));
        assert_eq!(result.total_attempts, 3);
        assert!(result.attempts[0].will_retry);
        assert!(result.attempts[0].next_retry_at.is_some());
        assert!(!result.attempts[2].will_retry);
        assert!(result.final_attempt().unwrap().success);
    }

    #[tokio::test]
    async fn test_non_matching_failure_fails_immediately() {
        let policy = RetryPolicy {
            max_attempts: 5,
            retryable_errors: vec!["timeout".to_string()],
            retryable_exit_codes: vec![75],
            ..Default::default()
        };
        let calls = AtomicU32::new(0);

        let result = wrapper(policy)
            .execute("issue", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AttemptFailure::with_exit_code("syntax error", 2)) }
            })
            .await;

        assert!(!result.succeeded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.total_attempts, 1);
        assert_eq!(result.failure_reason.as_deref(), Some("syntax error"));
        assert!(!result.circuit_breaker_triggered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_exit_code_consumes_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            retryable_exit_codes: vec![75],
            ..Default::default()
        };

        let result = wrapper(policy)
            .execute("issue", |_| async {
                Err::<(), _>(AttemptFailure::with_exit_code("temp failure", 75))
            })
            .await;

        assert_eq!(result.total_attempts, 3);
        assert!(result.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_spawning() {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: Duration::from_secs(60),
        }));
        registry.breaker("issue").record_failure();

        let wrapper = ResilienceWrapper::new(RetryPolicy::default(), Arc::clone(&registry));
        let calls = AtomicU32::new(0);
        let result = wrapper
            .execute("issue", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, AttemptFailure>(()) }
            })
            .await;

        assert!(result.circuit_breaker_triggered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(result.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_hook_opens_circuit_first() {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 100,
            success_threshold: 1,
            timeout: Duration::from_secs(60),
        }));
        let policy = RetryPolicy {
            max_attempts: 5,
            should_open_circuit: Some(Arc::new(|message, _| message.contains("quota"))),
            ..Default::default()
        };

        let wrapper = ResilienceWrapper::new(policy, Arc::clone(&registry));
        let result = wrapper
            .execute("spec", |_| async {
                Err::<(), _>(AttemptFailure::new("quota exhausted"))
            })
            .await;

        // The hook opened the circuit after the first failure; the second
        // attempt was rejected before running.
        assert!(result.circuit_breaker_triggered);
        assert_eq!(result.total_attempts, 1);
    }
}
