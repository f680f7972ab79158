// src/resilience/mod.rs
//! Resilience layer: retry policies and circuit breakers
//!
//! Pure policy over an "attempt a unit of work" callable. Nothing here
//! spawns processes; the wrapper only decides whether and when the next
//! attempt may run.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitMetrics, CircuitState,
};
pub use retry::{
    AttemptFailure, BackoffConfig, BackoffKind, ExecutionAttempt, ResilienceWrapper,
    ResilientExecutionResult, RetryPolicy,
};
