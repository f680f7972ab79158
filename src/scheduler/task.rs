// src/scheduler/task.rs
//! Task types for the scheduling engine

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A unit of schedulable work
///
/// Immutable after creation; the engine references it but never mutates it.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub id: String,

    /// Category tag, e.g. "issue", "spec", "custom"; keys the circuit
    /// breaker used by resilient executors
    pub kind: String,

    /// Free-text payload handed to the spawned process
    pub prompt: String,

    /// Filesystem root for the spawned process
    pub work_dir: Option<PathBuf>,

    /// Higher runs earlier
    pub priority: i32,

    /// Task ids that must complete before this one may start
    pub dependencies: HashSet<String>,

    pub created_at: DateTime<Utc>,

    /// Opaque per-kind settings
    pub config: serde_json::Value,
}

impl ExecutionTask {
    pub fn new(kind: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            kind: kind.into(),
            prompt: prompt.into(),
            work_dir: None,
            priority: 0,
            dependencies: HashSet::new(),
            created_at: Utc::now(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }
}

/// Lifecycle states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Terminal outcome delivered to completion/failure observers
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub kind: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,

    /// Failure reason, when the task did not complete
    pub reason: Option<String>,

    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_produces_unique_ids() {
        let a = ExecutionTask::new("issue", "fix the bug");
        let b = ExecutionTask::new("issue", "fix the bug");
        assert_ne!(a.id, b.id);
        assert_eq!(a.priority, 0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
