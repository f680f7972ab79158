// src/utils/config.rs
//! Engine configuration
//!
//! Loads `foreman.toml` (optional) merged with `FOREMAN_*` environment
//! overrides. The defaults here are the documented defaults of the engine:
//! 3 concurrent workers, a 5 second cancellation grace window, exponential
//! retry backoff capped at 30 seconds.

use serde::Deserialize;

use crate::resilience::retry::{BackoffConfig, BackoffKind, RetryPolicy};
use crate::utils::errors::Result;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Task scheduling engine settings
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Worker pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Agent command invoked by workers
    #[serde(default)]
    pub agent: AgentSettings,

    /// Retry policy applied around agent invocations
    #[serde(default)]
    pub retry: RetrySettings,
}

impl EngineConfig {
    /// Load configuration from `foreman.toml` and `FOREMAN_*` env vars
    pub fn load() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("foreman").required(false))
            .add_source(config::Environment::with_prefix("FOREMAN").separator("__"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}

/// Scheduling engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Maximum tasks running at once
    pub max_concurrent: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Maximum worker processes alive at once
    pub max_concurrent_workers: usize,

    /// Per-worker memory ceiling in megabytes
    pub memory_limit_mb: u64,

    /// Seconds to wait for a worker to exit after a cooperative cancel
    pub cancel_grace_secs: u64,

    /// Seconds to wait after a graceful signal before force-killing
    pub kill_grace_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 3,
            memory_limit_mb: 4096,
            cancel_grace_secs: 5,
            kill_grace_secs: 2,
        }
    }
}

/// Agent command settings
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Executable name or path; resolved through PATH when bare
    pub bin: String,

    /// Arguments passed to the agent executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Execution mode: "structured", "interactive" or "hybrid"
    #[serde(default = "default_agent_mode")]
    pub mode: String,

    /// Hard deadline for one agent attempt, in seconds (0 = none)
    #[serde(default)]
    pub timeout_secs: u64,
}

fn default_agent_mode() -> String {
    "structured".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            bin: "agent".to_string(),
            args: vec![],
            mode: default_agent_mode(),
            timeout_secs: 0,
        }
    }
}

/// Retry settings, converted to a [`RetryPolicy`] at use sites
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff: String,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    #[serde(default)]
    pub retryable_errors: Vec<String>,
    #[serde(default)]
    pub retryable_exit_codes: Vec<i32>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: "exponential".to_string(),
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            jitter: true,
            retryable_errors: vec![
                "timed out".to_string(),
                "rate limit".to_string(),
                "connection".to_string(),
                "overloaded".to_string(),
            ],
            retryable_exit_codes: vec![],
        }
    }
}

impl RetrySettings {
    /// Build the runtime retry policy from these settings
    pub fn to_policy(&self) -> RetryPolicy {
        let kind = match self.backoff.as_str() {
            "linear" => BackoffKind::Linear,
            "fixed" => BackoffKind::Fixed,
            _ => BackoffKind::Exponential,
        };

        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: BackoffConfig {
                kind,
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
                jitter: self.jitter,
            },
            retryable_errors: self.retryable_errors.clone(),
            retryable_exit_codes: self.retryable_exit_codes.clone(),
            should_open_circuit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.pool.max_concurrent_workers, 3);
        assert_eq!(cfg.pool.cancel_grace_secs, 5);
        assert_eq!(cfg.scheduler.max_concurrent, 4);
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn test_retry_settings_to_policy() {
        let settings = RetrySettings {
            backoff: "linear".to_string(),
            max_attempts: 0,
            ..Default::default()
        };
        let policy = settings.to_policy();
        // Zero attempts is nonsensical; clamped to one.
        assert_eq!(policy.max_attempts, 1);
        assert!(matches!(policy.backoff.kind, BackoffKind::Linear));
    }

    #[test]
    fn test_unknown_backoff_falls_back_to_exponential() {
        let settings = RetrySettings {
            backoff: "quadratic".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            settings.to_policy().backoff.kind,
            BackoffKind::Exponential
        ));
    }
}
