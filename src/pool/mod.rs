// src/pool/mod.rs
//! Worker pool: one isolated OS process per execution
//!
//! Crash isolation is the point: a crash, memory blow-up or hang in one
//! execution cannot corrupt or stall the orchestrator or other executions.
//! Each admitted execution forks a dedicated worker process, bootstrapped
//! purely through environment variables, with its memory ceiling enforced by
//! the OS and a JSON-lines IPC channel on its stdin/stdout.
//!
//! Cancellation escalates in two stages: a cooperative `cancel` frame, then
//! SIGTERM, then SIGKILL — each bounded by a grace window, so a hung worker
//! can never block pool shutdown indefinitely.
//!
//! The concurrency ceiling is a hard wall: unlike the scheduling engine's
//! queue, which absorbs burst submissions, admission past
//! `max_concurrent_workers` is rejected outright to protect host resources.

pub mod ipc;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::process::kill_group;
use crate::process::limits::child_setup;
use crate::utils::config::PoolSettings;
use crate::utils::errors::{EngineError, Result};
use ipc::{ParentMessage, WorkerMessage};

/// Upper bound for one IPC frame
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// How long the reaper waits for the output pumps to drain after exit
const PUMP_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Hard ceiling on concurrently alive workers
    pub max_concurrent_workers: usize,

    /// Per-worker address-space ceiling, enforced via RLIMIT_AS
    pub memory_limit_mb: u64,

    /// Worker executable; defaults to the current executable re-invoked
    /// with `worker_args`
    pub worker_program: Option<PathBuf>,

    pub worker_args: Vec<String>,

    /// Wait after the cooperative cancel frame before signalling
    pub cancel_grace: Duration,

    /// Wait after SIGTERM before SIGKILL
    pub kill_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 3,
            memory_limit_mb: 4096,
            worker_program: None,
            worker_args: vec!["worker".to_string()],
            cancel_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            max_concurrent_workers: settings.max_concurrent_workers,
            memory_limit_mb: settings.memory_limit_mb,
            cancel_grace: Duration::from_secs(settings.cancel_grace_secs),
            kill_grace: Duration::from_secs(settings.kill_grace_secs),
            ..Default::default()
        }
    }
}

/// Identity of one execution to run in a worker
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub execution_id: String,
    pub project_id: String,
}

/// Pool-level lifecycle states of a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    Completing,
    Completed,
    Failed,
}

/// Snapshot of a live worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub execution_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub status: WorkerStatus,
}

/// Classified worker exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub kind: WorkerExitKind,
}

/// Exit taxonomy: the pool must tell expected failures apart from
/// infrastructure-level crashes for the caller's retry/alerting decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExitKind {
    /// Exit code 0
    Completed,

    /// Exit code 1: application-level failure, non-fatal to the pool
    ExpectedFailure,

    /// Exit code 137 or a kill signal: OOM kill or forced termination
    OutOfMemoryKill,

    /// Any other signal
    Crash { signal: i32 },

    /// Any other non-zero exit code
    UnexpectedExit { code: i32 },
}

/// Classify a worker exit per the pool taxonomy
pub fn classify_exit(code: Option<i32>, signal: Option<i32>) -> WorkerExitKind {
    match (code, signal) {
        (Some(0), _) => WorkerExitKind::Completed,
        (Some(1), _) => WorkerExitKind::ExpectedFailure,
        (Some(137), _) => WorkerExitKind::OutOfMemoryKill,
        (_, Some(signal)) if signal == libc::SIGKILL => WorkerExitKind::OutOfMemoryKill,
        (_, Some(signal)) => WorkerExitKind::Crash { signal },
        (Some(code), None) => WorkerExitKind::UnexpectedExit { code },
        (None, None) => WorkerExitKind::UnexpectedExit { code: -1 },
    }
}

/// A log line surfaced to observers
#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: String,
    pub message: String,
    pub source: LogSource,
}

/// Where a forwarded log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// A `log` frame on the protocol channel
    Worker,

    /// Raw worker stderr
    Stderr,
}

/// Failure surfaced through `on_error`
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub message: String,
    pub fatal: bool,
}

/// Infrastructure-level crash surfaced through `on_crash`
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub exit: WorkerExit,
    pub message: String,
}

pub type LogObserver = Arc<dyn Fn(&str, &LogLine) + Send + Sync>;
pub type EventObserver = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;
pub type StatusObserver = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type CompleteObserver = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;
pub type ErrorObserver = Arc<dyn Fn(&str, &WorkerError) + Send + Sync>;
pub type CrashObserver = Arc<dyn Fn(&str, &CrashReport) + Send + Sync>;

#[derive(Default)]
struct Observers {
    log: parking_lot::RwLock<Vec<LogObserver>>,
    event: parking_lot::RwLock<Vec<EventObserver>>,
    status: parking_lot::RwLock<Vec<StatusObserver>>,
    complete: parking_lot::RwLock<Vec<CompleteObserver>>,
    error: parking_lot::RwLock<Vec<ErrorObserver>>,
    crash: parking_lot::RwLock<Vec<CrashObserver>>,
}

impl Observers {
    fn clear(&self) {
        self.log.write().clear();
        self.event.write().clear();
        self.status.write().clear();
        self.complete.write().clear();
        self.error.write().clear();
        self.crash.write().clear();
    }
}

struct WorkerHandle {
    worker_id: String,
    execution_id: String,
    pid: u32,
    started_at: DateTime<Utc>,
    status: parking_lot::Mutex<WorkerStatus>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
    cancel_requested: AtomicBool,
}

impl WorkerHandle {
    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.worker_id.clone(),
            execution_id: self.execution_id.clone(),
            pid: self.pid,
            started_at: self.started_at,
            status: *self.status.lock(),
        }
    }

    async fn send(&self, message: &ParentMessage) {
        let Ok(line) = ipc::encode(message) else {
            return;
        };
        let mut stdin = self.stdin.lock().await;
        if let Some(stdin) = stdin.as_mut() {
            // The worker may have exited already; a broken pipe is fine.
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.flush().await;
        }
    }
}

struct PoolInner {
    config: WorkerPoolConfig,
    workers: dashmap::DashMap<String, Arc<WorkerHandle>>,
    active: AtomicUsize,
    observers: Observers,
    shutting_down: AtomicBool,
}

/// Top-level orchestrator running each execution in its own OS process
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                workers: dashmap::DashMap::new(),
                active: AtomicUsize::new(0),
                observers: Observers::default(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Admit one execution and fork its worker process.
    ///
    /// Rejects with [`EngineError::PoolAtCapacity`] instead of queueing:
    /// the per-OS-process ceiling protects host resources and must be a
    /// hard wall.
    pub async fn start_execution(
        &self,
        spec: &ExecutionSpec,
        repo_path: &Path,
        db_path: &Path,
    ) -> Result<String> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let max = self.inner.config.max_concurrent_workers;
        self.inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|active| EngineError::PoolAtCapacity { active, max })?;

        match self.spawn_worker(spec, repo_path, db_path).await {
            Ok(worker_id) => Ok(worker_id),
            Err(e) => {
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn spawn_worker(
        &self,
        spec: &ExecutionSpec,
        repo_path: &Path,
        db_path: &Path,
    ) -> Result<String> {
        let worker_id = Ulid::new().to_string();
        let program = match &self.inner.config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| EngineError::SpawnFailed(format!("cannot locate worker binary: {e}")))?,
        };

        let memory_limit_mb = self.inner.config.memory_limit_mb;
        let mut cmd = Command::new(&program);
        cmd.args(&self.inner.config.worker_args)
            .env(ipc::ENV_EXECUTION_ID, &spec.execution_id)
            .env(ipc::ENV_PROJECT_ID, &spec.project_id)
            .env(ipc::ENV_REPO_PATH, repo_path)
            .env(ipc::ENV_DB_PATH, db_path)
            .env(ipc::ENV_WORKER_ID, &worker_id)
            .env(ipc::ENV_MEMORY_LIMIT_MB, memory_limit_mb.to_string())
            .current_dir(repo_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        unsafe {
            cmd.pre_exec(move || child_setup(Some(memory_limit_mb)));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| EngineError::SpawnFailed("no process id assigned".to_string()))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = Arc::new(WorkerHandle {
            worker_id: worker_id.clone(),
            execution_id: spec.execution_id.clone(),
            pid,
            started_at: Utc::now(),
            status: parking_lot::Mutex::new(WorkerStatus::Starting),
            stdin: tokio::sync::Mutex::new(stdin),
            exit_rx,
            cancel_requested: AtomicBool::new(false),
        });
        self.inner.workers.insert(worker_id.clone(), Arc::clone(&handle));
        metrics::gauge!("foreman_workers_active").set(self.inner.active.load(Ordering::SeqCst) as f64);

        let stdout_pump = stdout.map(|stdout| {
            let inner = Arc::clone(&self.inner);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let mut frames = FramedRead::new(
                    stdout,
                    LinesCodec::new_with_max_length(MAX_FRAME_LEN),
                );
                while let Some(line) = futures::StreamExt::next(&mut frames).await {
                    match line {
                        Ok(line) => {
                            if let Some(message) = ipc::decode_worker(&line) {
                                dispatch_frame(&inner, &handle, message);
                            }
                        }
                        Err(e) => {
                            warn!(worker_id = %handle.worker_id, err = %e, "worker frame stream error");
                            break;
                        }
                    }
                }
            })
        });

        let stderr_pump = stderr.map(|stderr| {
            let inner = Arc::clone(&self.inner);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let mut lines = FramedRead::new(
                    stderr,
                    LinesCodec::new_with_max_length(MAX_FRAME_LEN),
                );
                while let Some(Ok(line)) = futures::StreamExt::next(&mut lines).await {
                    let log = LogLine {
                        level: "error".to_string(),
                        message: line,
                        source: LogSource::Stderr,
                    };
                    for observer in inner.observers.log.read().iter() {
                        observer(&handle.execution_id, &log);
                    }
                }
            })
        });

        {
            let inner = Arc::clone(&self.inner);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let status = child.wait().await;
                let (code, signal) = match status {
                    Ok(status) => {
                        use std::os::unix::process::ExitStatusExt;
                        (status.code(), status.signal())
                    }
                    Err(e) => {
                        warn!(worker_id = %handle.worker_id, err = %e, "worker wait failed");
                        (None, None)
                    }
                };

                // Drain remaining frames before reporting the exit, so a
                // `complete` frame sitting in the pipe is never observed
                // after the worker is reaped. Bounded: a grandchild holding
                // the pipe open must not stall the reap forever.
                for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
                    let _ = tokio::time::timeout(PUMP_DRAIN_GRACE, pump).await;
                }

                let exit = WorkerExit {
                    code,
                    signal,
                    kind: classify_exit(code, signal),
                };
                reap_worker(&inner, &handle, exit, exit_tx);
            });
        }

        info!(worker_id = %worker_id, execution_id = %spec.execution_id, pid, "worker started");
        Ok(worker_id)
    }

    /// Two-stage cancellation: cooperative frame, then SIGTERM, then SIGKILL.
    ///
    /// Bounded by the configured grace windows; idempotent for unknown or
    /// already-exited workers.
    pub async fn cancel_execution(&self, worker_id: &str) -> Result<()> {
        let Some(handle) = self.inner.workers.get(worker_id).map(|h| Arc::clone(&h)) else {
            return Ok(());
        };
        handle.cancel_requested.store(true, Ordering::SeqCst);
        debug!(worker_id, "requesting cooperative cancel");
        handle.send(&ParentMessage::Cancel).await;

        let mut exit_rx = handle.exit_rx.clone();
        let grace = self.inner.config.cancel_grace;
        if tokio::time::timeout(grace, exit_rx.wait_for(|e| e.is_some()))
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(worker_id, "worker ignored cancel, sending SIGTERM");
        kill_group(handle.pid, Signal::SIGTERM);
        let grace = self.inner.config.kill_grace;
        if tokio::time::timeout(grace, exit_rx.wait_for(|e| e.is_some()))
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(worker_id, "worker survived SIGTERM, force killing");
        kill_group(handle.pid, Signal::SIGKILL);
        let _ = tokio::time::timeout(grace, exit_rx.wait_for(|e| e.is_some())).await;
        Ok(())
    }

    /// Ask a worker to finish cleanly (flush and exit zero)
    pub async fn request_shutdown(&self, worker_id: &str) -> Result<()> {
        if let Some(handle) = self.inner.workers.get(worker_id).map(|h| Arc::clone(&h)) {
            handle.send(&ParentMessage::Shutdown).await;
        }
        Ok(())
    }

    /// Liveness probe; the worker answers with a `pong` frame
    pub async fn ping(&self, worker_id: &str) -> Result<()> {
        if let Some(handle) = self.inner.workers.get(worker_id).map(|h| Arc::clone(&h)) {
            handle.send(&ParentMessage::Ping).await;
        }
        Ok(())
    }

    /// Cancel every tracked worker concurrently. Idempotent: a re-entrant
    /// call while one shutdown is in progress is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let worker_ids: Vec<String> = self
            .inner
            .workers
            .iter()
            .map(|h| h.worker_id.clone())
            .collect();
        info!(workers = worker_ids.len(), "pool shutting down");

        let cancels = worker_ids.iter().map(|id| self.cancel_execution(id));
        futures::future::join_all(cancels).await;
        self.inner.observers.clear();
        Ok(())
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn worker_info(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.inner.workers.get(worker_id).map(|h| h.info())
    }

    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        self.inner.workers.iter().map(|h| h.info()).collect()
    }

    /// Find the live worker running an execution, if any
    pub fn worker_for_execution(&self, execution_id: &str) -> Option<WorkerInfo> {
        self.inner
            .workers
            .iter()
            .find(|h| h.execution_id == execution_id)
            .map(|h| h.info())
    }

    pub fn on_log(&self, observer: LogObserver) {
        self.inner.observers.log.write().push(observer);
    }

    pub fn on_event(&self, observer: EventObserver) {
        self.inner.observers.event.write().push(observer);
    }

    pub fn on_status_change(&self, observer: StatusObserver) {
        self.inner.observers.status.write().push(observer);
    }

    pub fn on_complete(&self, observer: CompleteObserver) {
        self.inner.observers.complete.write().push(observer);
    }

    pub fn on_error(&self, observer: ErrorObserver) {
        self.inner.observers.error.write().push(observer);
    }

    pub fn on_crash(&self, observer: CrashObserver) {
        self.inner.observers.crash.write().push(observer);
    }
}

/// Route one protocol frame to bookkeeping and observers
fn dispatch_frame(inner: &Arc<PoolInner>, handle: &Arc<WorkerHandle>, message: WorkerMessage) {
    let execution_id = handle.execution_id.as_str();
    match message {
        WorkerMessage::Ready => {
            *handle.status.lock() = WorkerStatus::Running;
            for observer in inner.observers.status.read().iter() {
                observer(execution_id, "ready");
            }
        }
        WorkerMessage::Log { level, message } => {
            let log = LogLine {
                level,
                message,
                source: LogSource::Worker,
            };
            for observer in inner.observers.log.read().iter() {
                observer(execution_id, &log);
            }
        }
        WorkerMessage::Event { payload } => {
            for observer in inner.observers.event.read().iter() {
                observer(execution_id, &payload);
            }
        }
        WorkerMessage::Status { phase } => {
            if phase == "completing" {
                *handle.status.lock() = WorkerStatus::Completing;
            }
            for observer in inner.observers.status.read().iter() {
                observer(execution_id, &phase);
            }
        }
        WorkerMessage::Complete { result } => {
            *handle.status.lock() = WorkerStatus::Completing;
            for observer in inner.observers.complete.read().iter() {
                observer(execution_id, &result);
            }
        }
        WorkerMessage::Error { message, fatal } => {
            let error = WorkerError { message, fatal };
            for observer in inner.observers.error.read().iter() {
                observer(execution_id, &error);
            }
        }
        WorkerMessage::Pong => {
            debug!(worker_id = %handle.worker_id, "worker is alive");
        }
    }
}

/// Classify the exit, notify observers, and drop the worker from the live
/// map — historical data must be persisted by the caller before this point
fn reap_worker(
    inner: &Arc<PoolInner>,
    handle: &Arc<WorkerHandle>,
    exit: WorkerExit,
    exit_tx: watch::Sender<Option<WorkerExit>>,
) {
    let execution_id = handle.execution_id.as_str();
    debug!(
        worker_id = %handle.worker_id,
        code = ?exit.code,
        signal = ?exit.signal,
        kind = ?exit.kind,
        "worker exited"
    );

    match &exit.kind {
        WorkerExitKind::Completed => {
            *handle.status.lock() = WorkerStatus::Completed;
        }
        WorkerExitKind::ExpectedFailure => {
            *handle.status.lock() = WorkerStatus::Failed;
            let error = WorkerError {
                message: "worker reported execution failure (exit code 1)".to_string(),
                fatal: false,
            };
            for observer in inner.observers.error.read().iter() {
                observer(execution_id, &error);
            }
        }
        WorkerExitKind::OutOfMemoryKill | WorkerExitKind::Crash { .. } => {
            *handle.status.lock() = WorkerStatus::Failed;
            let message = match &exit.kind {
                WorkerExitKind::OutOfMemoryKill => {
                    "worker killed: out of memory or forced termination".to_string()
                }
                WorkerExitKind::Crash { signal } => {
                    format!("worker crashed on signal {signal}")
                }
                _ => unreachable!(),
            };
            metrics::counter!("foreman_workers_crashed_total").increment(1);

            let report = CrashReport {
                exit: exit.clone(),
                message: message.clone(),
            };
            for observer in inner.observers.crash.read().iter() {
                observer(execution_id, &report);
            }
            let error = WorkerError {
                message,
                fatal: true,
            };
            for observer in inner.observers.error.read().iter() {
                observer(execution_id, &error);
            }
        }
        WorkerExitKind::UnexpectedExit { code } => {
            *handle.status.lock() = WorkerStatus::Failed;
            let error = WorkerError {
                message: format!("worker exited unexpectedly with code {code}"),
                fatal: true,
            };
            for observer in inner.observers.error.read().iter() {
                observer(execution_id, &error);
            }
        }
    }

    inner.workers.remove(&handle.worker_id);
    inner.active.fetch_sub(1, Ordering::SeqCst);
    metrics::gauge!("foreman_workers_active").set(inner.active.load(Ordering::SeqCst) as f64);
    let _ = exit_tx.send(Some(exit));
}
