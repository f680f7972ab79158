// src/process/structured.rs
//! Pipe-based process manager
//!
//! Spawns children with piped stdio and delivers stdout/stderr separately,
//! line by line, to registered output handlers. Termination is graceful
//! first (SIGTERM to the child's process group), escalating to SIGKILL after
//! a 2 second grace window. A configured hard timeout kills the process and
//! marks it crashed regardless of its internal state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::process::limits::child_setup;
use crate::process::{
    kill_group, ErrorHandler, ManagedProcess, ManagerMetrics, OutputHandler, OutputStream,
    ProcessConfig, ProcessExit, ProcessManager, ProcessMetrics, ProcessMode, ProcessStatus,
};
use crate::utils::errors::{EngineError, Result};

/// Grace window between the graceful signal and the forced kill
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

struct EntryState {
    status: ProcessStatus,
    spawned_at: Instant,
    last_activity: Instant,
    exit_code: Option<i32>,
    signal: Option<i32>,
    timed_out: bool,
    tasks_completed: u64,
}

struct ProcessEntry {
    id: String,
    pid: u32,
    state: parking_lot::Mutex<EntryState>,
    output_handlers: parking_lot::RwLock<Vec<OutputHandler>>,
    error_handlers: parking_lot::RwLock<Vec<ErrorHandler>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessEntry {
    fn snapshot(&self) -> ManagedProcess {
        let state = self.state.lock();
        let crashes = u64::from(state.status == ProcessStatus::Crashed);
        let finished = state.tasks_completed + crashes;

        ManagedProcess {
            id: self.id.clone(),
            pid: self.pid,
            status: state.status,
            spawned_at: state.spawned_at,
            last_activity: state.last_activity,
            exit_code: state.exit_code,
            signal: state.signal,
            metrics: ProcessMetrics {
                total_duration: state.spawned_at.elapsed(),
                tasks_completed: state.tasks_completed,
                success_rate: if finished == 0 {
                    1.0
                } else {
                    state.tasks_completed as f64 / finished as f64
                },
            },
        }
    }

    fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    fn deliver_output(&self, chunk: &[u8], stream: OutputStream) {
        self.touch();
        let handlers = self.output_handlers.read().clone();
        for handler in handlers {
            handler(chunk, stream);
        }
    }

    fn deliver_error(&self, error: &EngineError) {
        let handlers = self.error_handlers.read().clone();
        for handler in handlers {
            handler(error);
        }
    }
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    crashed: AtomicU64,
}

/// Pipe-based [`ProcessManager`] implementation
pub struct StructuredProcessManager {
    processes: Arc<DashMap<String, Arc<ProcessEntry>>>,
    executable_cache: parking_lot::Mutex<HashMap<String, PathBuf>>,
    counters: Arc<Counters>,
}

impl StructuredProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(DashMap::new()),
            executable_cache: parking_lot::Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Resolve an executable name through PATH, with caching
    fn resolve_executable(&self, executable: &str) -> Result<PathBuf> {
        if executable.contains(std::path::MAIN_SEPARATOR) {
            return Ok(PathBuf::from(executable));
        }

        if let Some(path) = self.executable_cache.lock().get(executable) {
            return Ok(path.clone());
        }

        let path = which::which(executable).map_err(|e| {
            EngineError::SpawnFailed(format!("executable '{executable}' not found in PATH: {e}"))
        })?;

        self.executable_cache
            .lock()
            .insert(executable.to_string(), path.clone());
        Ok(path)
    }

    fn entry(&self, id: &str) -> Result<Arc<ProcessEntry>> {
        self.processes
            .get(id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| EngineError::ProcessNotFound(id.to_string()))
    }

    fn spawn_output_pump(
        entry: Arc<ProcessEntry>,
        reader: impl AsyncRead + Unpin + Send + 'static,
        stream: OutputStream,
    ) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => entry.deliver_output(&line, stream),
                    Err(e) => {
                        debug!(process_id = %entry.id, err = %e, "output stream closed");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_supervisor(
        &self,
        entry: Arc<ProcessEntry>,
        mut child: Child,
        timeout: Option<Duration>,
        exit_tx: watch::Sender<Option<ProcessExit>>,
    ) {
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            let status = match timeout {
                Some(deadline) => {
                    tokio::select! {
                        status = child.wait() => status,
                        _ = tokio::time::sleep(deadline) => {
                            warn!(process_id = %entry.id, ?deadline, "process timed out, killing");
                            entry.state.lock().timed_out = true;
                            entry.deliver_error(&EngineError::Timeout(deadline));
                            kill_group(entry.pid, Signal::SIGKILL);
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    }
                }
                None => child.wait().await,
            };

            let (code, signal) = match status {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    (status.code(), status.signal())
                }
                Err(e) => {
                    warn!(process_id = %entry.id, err = %e, "wait failed");
                    (None, None)
                }
            };

            let exit = {
                let mut state = entry.state.lock();
                state.exit_code = code;
                state.signal = signal;

                let crashed = state.timed_out || signal.is_some() || code.is_none();
                state.status = if crashed {
                    ProcessStatus::Crashed
                } else {
                    ProcessStatus::Completed
                };
                if code == Some(0) {
                    state.tasks_completed += 1;
                }

                ProcessExit {
                    code,
                    signal,
                    status: state.status,
                    duration: state.spawned_at.elapsed(),
                }
            };

            if exit.status == ProcessStatus::Crashed {
                counters.crashed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("foreman_processes_crashed_total").increment(1);
            } else {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }

            debug!(
                process_id = %entry.id,
                exit_code = ?exit.code,
                signal = ?exit.signal,
                "process exited"
            );
            let _ = exit_tx.send(Some(exit));
        });
    }

    fn spawn_idle_monitor(entry: Arc<ProcessEntry>, idle_timeout: Duration) {
        tokio::spawn(async move {
            let tick = idle_timeout.min(Duration::from_millis(250)).max(Duration::from_millis(10));
            loop {
                tokio::time::sleep(tick).await;
                let idle_for = {
                    let state = entry.state.lock();
                    if state.status.is_terminal() {
                        return;
                    }
                    state.last_activity.elapsed()
                };
                if idle_for >= idle_timeout {
                    info!(process_id = %entry.id, "idle timeout reached, terminating");
                    kill_group(entry.pid, Signal::SIGTERM);
                    return;
                }
            }
        });
    }
}

impl Default for StructuredProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for StructuredProcessManager {
    async fn acquire_process(&self, config: ProcessConfig) -> Result<ManagedProcess> {
        if config.mode != ProcessMode::Structured {
            return Err(EngineError::SpawnFailed(format!(
                "structured manager cannot spawn {:?} sessions",
                config.mode
            )));
        }

        let executable = self.resolve_executable(&config.executable)?;
        debug!(executable = %executable.display(), "spawning structured process");

        let mut cmd = Command::new(&executable);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = &config.work_dir {
            cmd.current_dir(dir);
        }
        unsafe {
            cmd.pre_exec(|| child_setup(None));
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
        let now = Instant::now();
        let entry = Arc::new(ProcessEntry {
            id: Ulid::new().to_string(),
            pid,
            state: parking_lot::Mutex::new(EntryState {
                status: ProcessStatus::Spawning,
                spawned_at: now,
                last_activity: now,
                exit_code: None,
                signal: None,
                timed_out: false,
                tasks_completed: 0,
            }),
            output_handlers: parking_lot::RwLock::new(Vec::new()),
            error_handlers: parking_lot::RwLock::new(Vec::new()),
            stdin: tokio::sync::Mutex::new(stdin),
            exit_rx,
        });

        self.processes.insert(entry.id.clone(), Arc::clone(&entry));

        if let Some(stdout) = stdout {
            Self::spawn_output_pump(Arc::clone(&entry), stdout, OutputStream::Stdout);
        }
        if let Some(stderr) = stderr {
            Self::spawn_output_pump(Arc::clone(&entry), stderr, OutputStream::Stderr);
        }
        self.spawn_supervisor(Arc::clone(&entry), child, config.timeout, exit_tx);
        if let Some(idle) = config.idle_timeout {
            Self::spawn_idle_monitor(Arc::clone(&entry), idle);
        }

        {
            // A very fast child may already have exited; never clobber a
            // terminal state back to busy.
            let mut state = entry.state.lock();
            if state.status == ProcessStatus::Spawning {
                state.status = ProcessStatus::Busy;
            }
        }
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("foreman_processes_spawned_total").increment(1);
        info!(process_id = %entry.id, pid, "structured process spawned");

        Ok(entry.snapshot())
    }

    async fn release_process(&self, id: &str) -> Result<()> {
        self.terminate_process(id, None).await
    }

    async fn terminate_process(&self, id: &str, signal: Option<Signal>) -> Result<()> {
        let Some(entry) = self.processes.get(id).map(|e| Arc::clone(&e)) else {
            return Ok(());
        };

        {
            let mut state = entry.state.lock();
            if state.status.is_terminal() {
                return Ok(());
            }
            state.status = ProcessStatus::Terminating;
        }

        kill_group(entry.pid, signal.unwrap_or(Signal::SIGTERM));

        let mut exit_rx = entry.exit_rx.clone();
        let exited =
            tokio::time::timeout(TERMINATE_GRACE, exit_rx.wait_for(|e| e.is_some())).await;
        if exited.is_err() {
            warn!(process_id = %id, "grace window elapsed, force killing");
            kill_group(entry.pid, Signal::SIGKILL);
        }

        Ok(())
    }

    async fn send_input(&self, id: &str, data: &[u8]) -> Result<()> {
        let entry = self.entry(id)?;
        let mut stdin = entry.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| EngineError::Os("input channel already closed".to_string()))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        entry.touch();
        Ok(())
    }

    async fn close_input(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        entry.stdin.lock().await.take();
        Ok(())
    }

    fn on_output(&self, id: &str, handler: OutputHandler) -> Result<()> {
        let entry = self.entry(id)?;
        entry.output_handlers.write().push(handler);
        Ok(())
    }

    fn on_error(&self, id: &str, handler: ErrorHandler) -> Result<()> {
        let entry = self.entry(id)?;
        entry.error_handlers.write().push(handler);
        Ok(())
    }

    async fn wait_for_exit(&self, id: &str) -> Result<ProcessExit> {
        let entry = self.entry(id)?;
        let mut exit_rx = entry.exit_rx.clone();
        let exit = exit_rx
            .wait_for(|e| e.is_some())
            .await
            .map_err(|_| EngineError::Os("process supervisor dropped".to_string()))?;
        Ok(exit.clone().expect("watch matched Some"))
    }

    fn get_process(&self, id: &str) -> Option<ManagedProcess> {
        self.processes.get(id).map(|e| e.snapshot())
    }

    fn get_active_processes(&self) -> Vec<ManagedProcess> {
        self.processes
            .iter()
            .map(|e| e.snapshot())
            .filter(|p| !p.status.is_terminal())
            .collect()
    }

    fn get_metrics(&self) -> ManagerMetrics {
        ManagerMetrics {
            active_processes: self.get_active_processes().len(),
            spawned_total: self.counters.spawned.load(Ordering::Relaxed),
            completed_total: self.counters.completed.load(Ordering::Relaxed),
            crashed_total: self.counters.crashed.load(Ordering::Relaxed),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let ids: Vec<String> = self.processes.iter().map(|e| e.id.clone()).collect();
        let terminations = ids.iter().map(|id| self.terminate_process(id, None));
        futures::future::join_all(terminations).await;
        self.processes.clear();
        Ok(())
    }
}
