// src/process/mod.rs
//! Process management abstraction
//!
//! One contract, two implementations:
//!
//! - [`StructuredProcessManager`]: pipe-based children with separate
//!   stdout/stderr streams and line-oriented output delivery
//! - [`InteractiveProcessManager`]: pseudo-terminal sessions with combined
//!   full-duplex terminal I/O
//!
//! A managed process moves `Spawning → Busy → {Completed | Crashed}`, with
//! `Terminating` as a transient state during an explicit termination request.
//! It never re-enters `Busy` after reaching a terminal state.

pub mod interactive;
pub mod limits;
pub mod structured;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::resilience::retry::RetryPolicy;
use crate::utils::errors::{EngineError, Result};

pub use interactive::InteractiveProcessManager;
pub use structured::StructuredProcessManager;

/// Lifecycle states of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Spawning,
    Idle,
    Busy,
    Terminating,
    Crashed,
    Completed,
}

impl ProcessStatus {
    /// Whether the process can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Crashed | ProcessStatus::Completed)
    }
}

/// Which output channel produced a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Execution mode for a spawned process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Piped stdio, line-oriented output
    #[default]
    Structured,
    /// Pseudo-terminal session, combined output
    Interactive,
    /// Pseudo-terminal session whose output is split on newlines before
    /// delivery, so line-oriented consumers can parse it
    Hybrid,
}

/// Terminal geometry for interactive/hybrid sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub cols: u16,
    pub rows: u16,

    /// Working directory of the terminal session; falls back to `work_dir`
    pub cwd: Option<PathBuf>,

    /// Terminal name advertised via TERM
    pub name: Option<String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: 120,
            rows: 34,
            cwd: None,
            name: None,
        }
    }
}

/// Spawn parameters for one process
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Executable name or path; bare names are resolved through PATH
    pub executable: String,

    pub args: Vec<String>,

    /// Working directory for the child
    pub work_dir: Option<PathBuf>,

    /// Environment overrides applied on top of the inherited environment
    pub env: HashMap<String, String>,

    /// Hard kill deadline; on expiry the process is terminated and marked
    /// crashed regardless of its internal state
    pub timeout: Option<Duration>,

    /// Pool-reuse deadline. Honored only by pooled short-lived runners; the
    /// worker-per-execution managers terminate on release instead.
    pub idle_timeout: Option<Duration>,

    /// Retry policy carried for wrappers; the managers themselves never retry
    pub retry: Option<RetryPolicy>,

    pub mode: ProcessMode,

    /// Only consulted for interactive/hybrid mode
    pub terminal: Option<TerminalConfig>,
}

/// Per-process runtime metrics
#[derive(Debug, Clone, Default)]
pub struct ProcessMetrics {
    /// Wall-clock time from spawn to exit (or so far, if still running)
    pub total_duration: Duration,

    pub tasks_completed: u64,

    /// Completed / (completed + crashed), 1.0 while nothing finished
    pub success_rate: f64,
}

/// Snapshot of one managed process
///
/// Handed out by accessor methods only; the underlying OS handle stays owned
/// by the manager that spawned it.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub id: String,
    pub pid: u32,
    pub status: ProcessStatus,
    pub spawned_at: Instant,

    /// Updated on every I/O event; drives idle-timeout decisions
    pub last_activity: Instant,

    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub metrics: ProcessMetrics,
}

/// How a process left the `Busy` state
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,

    /// `Completed` for clean exits, `Crashed` for signal/timeout exits
    pub status: ProcessStatus,

    pub duration: Duration,
}

impl ProcessExit {
    /// Clean zero exit
    pub fn success(&self) -> bool {
        self.status == ProcessStatus::Completed && self.code == Some(0)
    }
}

/// Aggregate metrics across a manager's lifetime
#[derive(Debug, Clone, Default)]
pub struct ManagerMetrics {
    pub active_processes: usize,
    pub spawned_total: u64,
    pub completed_total: u64,
    pub crashed_total: u64,
}

/// Output callback: `(chunk, stream)`
pub type OutputHandler = Arc<dyn Fn(&[u8], OutputStream) + Send + Sync>;

/// Error callback for spawn/runtime errors of one process
pub type ErrorHandler = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// Uniform lifecycle/I-O contract over spawned OS processes
///
/// Implemented identically by the structured and the interactive variant;
/// callers hold it as `Arc<dyn ProcessManager>`.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a process per `config.mode` and start supervising it
    async fn acquire_process(&self, config: ProcessConfig) -> Result<ManagedProcess>;

    /// Alias for [`terminate_process`] — there is no idle-pool reuse in the
    /// worker-per-execution model
    ///
    /// [`terminate_process`]: ProcessManager::terminate_process
    async fn release_process(&self, id: &str) -> Result<()>;

    /// Idempotent termination: graceful signal first where the variant has
    /// one, then a forced kill after a 2 second grace window
    async fn terminate_process(&self, id: &str, signal: Option<Signal>) -> Result<()>;

    /// Write to the process input channel
    async fn send_input(&self, id: &str, data: &[u8]) -> Result<()>;

    /// Close the input side (no-op for interactive sessions)
    async fn close_input(&self, id: &str) -> Result<()>;

    /// Register an output callback; invocation order preserves the order
    /// bytes were produced by the process
    fn on_output(&self, id: &str, handler: OutputHandler) -> Result<()>;

    /// Register an error callback
    fn on_error(&self, id: &str, handler: ErrorHandler) -> Result<()>;

    /// Suspend until the process exits; resolves immediately if it already
    /// has
    async fn wait_for_exit(&self, id: &str) -> Result<ProcessExit>;

    fn get_process(&self, id: &str) -> Option<ManagedProcess>;

    fn get_active_processes(&self) -> Vec<ManagedProcess>;

    fn get_metrics(&self) -> ManagerMetrics;

    /// Terminate every tracked process and clear internal maps; safe to call
    /// with zero active processes
    async fn shutdown(&self) -> Result<()>;
}

/// Signal a whole process group; ESRCH (already gone) is not an error.
///
/// Children are started as session leaders (see [`limits`]), so the group id
/// equals the child pid and escalation reaches grandchildren too.
pub(crate) fn kill_group(pid: u32, signal: Signal) {
    let group = Pid::from_raw(-(pid as i32));
    match kill(group, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, err = %e, "failed to signal process group"),
    }
}
