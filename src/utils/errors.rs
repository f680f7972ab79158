// src/utils/errors.rs
//! Engine error types
//!
//! Every fallible operation in the engine returns [`Result`]. Process-level
//! failures are recovered close to where they happen and reported upward via
//! callbacks; the errors here are the ones surfaced synchronously to callers.

use std::time::Duration;
use thiserror::Error;

/// Engine-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The OS refused to create a process, or no pid was assigned
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// An operation referenced a process id that is no longer tracked
    #[error("process not found: {0}")]
    ProcessNotFound(String),

    /// A process exceeded its configured hard deadline
    #[error("process exceeded timeout of {0:?}")]
    Timeout(Duration),

    /// An operation referenced a task id that is no longer tracked
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The worker pool is at its concurrency ceiling
    #[error(
        "worker pool at capacity ({active}/{max} workers busy); \
         retry after an execution finishes or raise max_concurrent_workers"
    )]
    PoolAtCapacity { active: usize, max: usize },

    /// An attempt was rejected because the circuit for its task kind is open
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// The component has been shut down and accepts no further work
    #[error("engine component is shut down")]
    ShutDown,

    /// Worker bootstrap environment is missing or malformed
    #[error("worker environment invalid: {0}")]
    WorkerEnv(String),

    /// Signal delivery or another OS-level call failed
    #[error("os error: {0}")]
    Os(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame on the IPC channel could not be encoded
    #[error("ipc encode error: {0}")]
    Ipc(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl EngineError {
    /// Whether this error means the referenced entity simply is not tracked
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::ProcessNotFound(_) | EngineError::TaskNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message_is_actionable() {
        let err = EngineError::PoolAtCapacity { active: 3, max: 3 };
        let msg = err.to_string();
        assert!(msg.contains("3/3"));
        assert!(msg.contains("max_concurrent_workers"));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(EngineError::ProcessNotFound("p1".into()).is_not_found());
        assert!(EngineError::TaskNotFound("t1".into()).is_not_found());
        assert!(!EngineError::ShutDown.is_not_found());
    }
}
