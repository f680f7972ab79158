// src/process/interactive.rs
//! Pseudo-terminal process manager
//!
//! Spawns sessions on a PTY for agents that need full terminal semantics.
//! A PTY does not distinguish error output, so everything is delivered as a
//! single combined `stdout` stream, and errors are synthesized only from a
//! non-zero exit code. There is no graceful termination path: terminating an
//! interactive session kills it immediately.
//!
//! `Hybrid` mode spawns the same PTY session but splits output on newlines
//! before delivery, so line-oriented consumers can parse it.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use nix::sys::signal::Signal;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::process::{
    ErrorHandler, ManagedProcess, ManagerMetrics, OutputHandler, OutputStream, ProcessConfig,
    ProcessExit, ProcessManager, ProcessMetrics, ProcessMode, ProcessStatus, TerminalConfig,
};
use crate::utils::errors::{EngineError, Result};

/// Grace window waited for the exit report after a kill
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

struct SessionState {
    status: ProcessStatus,
    spawned_at: Instant,
    last_activity: Instant,
    exit_code: Option<i32>,
    killed: bool,
    timed_out: bool,
    tasks_completed: u64,
}

struct SessionEntry {
    id: String,
    pid: u32,
    state: parking_lot::Mutex<SessionState>,
    output_handlers: parking_lot::RwLock<Vec<OutputHandler>>,
    error_handlers: parking_lot::RwLock<Vec<ErrorHandler>>,
    writer: parking_lot::Mutex<Option<Box<dyn Write + Send>>>,
    killer: parking_lot::Mutex<Box<dyn ChildKiller + Send + Sync>>,
    // Keeps the PTY alive for the session's lifetime.
    _master: parking_lot::Mutex<Box<dyn MasterPty + Send>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl SessionEntry {
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
            signal: None,
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

    fn deliver_output(&self, chunk: &[u8]) {
        self.state.lock().last_activity = Instant::now();
        let handlers = self.output_handlers.read().clone();
        for handler in handlers {
            // A pty cannot tell error output apart; everything is stdout.
            handler(chunk, OutputStream::Stdout);
        }
    }

    fn deliver_error(&self, error: &EngineError) {
        let handlers = self.error_handlers.read().clone();
        for handler in handlers {
            handler(error);
        }
    }

    fn kill_now(&self) {
        if let Err(e) = self.killer.lock().kill() {
            debug!(session_id = %self.id, err = %e, "kill failed (already exited?)");
        }
    }
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    crashed: AtomicU64,
}

/// PTY-based [`ProcessManager`] implementation
pub struct InteractiveProcessManager {
    sessions: Arc<DashMap<String, Arc<SessionEntry>>>,
    counters: Arc<Counters>,
}

impl InteractiveProcessManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<SessionEntry>> {
        self.sessions
            .get(id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| EngineError::ProcessNotFound(id.to_string()))
    }

    /// Pump the PTY reader on a dedicated thread; PTY reads are blocking
    fn spawn_reader(entry: Arc<SessionEntry>, mut reader: Box<dyn Read + Send>, line_split: bool) {
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            let mut pending: Vec<u8> = Vec::new();
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if line_split {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        entry.deliver_output(&line);
                    }
                } else {
                    entry.deliver_output(&buf[..n]);
                }
            }
            if !pending.is_empty() {
                entry.deliver_output(&pending);
            }
        });
    }

    fn spawn_supervisor(
        &self,
        entry: Arc<SessionEntry>,
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        timeout: Option<Duration>,
        exit_tx: watch::Sender<Option<ProcessExit>>,
    ) {
        let counters = Arc::clone(&self.counters);

        if let Some(deadline) = timeout {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                let mut exit_rx = entry.exit_rx.clone();
                let exited =
                    tokio::time::timeout(deadline, exit_rx.wait_for(|e| e.is_some())).await;
                if exited.is_err() {
                    warn!(session_id = %entry.id, ?deadline, "session timed out, killing");
                    entry.state.lock().timed_out = true;
                    entry.deliver_error(&EngineError::Timeout(deadline));
                    entry.kill_now();
                }
            });
        }

        tokio::task::spawn_blocking(move || {
            let status = child.wait();
            let code = match status {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    warn!(session_id = %entry.id, err = %e, "wait failed");
                    None
                }
            };

            let exit = {
                let mut state = entry.state.lock();
                state.exit_code = code;

                let crashed = state.timed_out || state.killed || code.is_none();
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
                    signal: None,
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

            // The only error channel a pty has is the exit code.
            if let Some(code) = exit.code.filter(|c| *c != 0) {
                entry.deliver_error(&EngineError::Os(format!(
                    "terminal session exited with code {code}"
                )));
            }

            debug!(session_id = %entry.id, exit_code = ?exit.code, "session exited");
            let _ = exit_tx.send(Some(exit));
        });
    }
}

impl Default for InteractiveProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for InteractiveProcessManager {
    async fn acquire_process(&self, config: ProcessConfig) -> Result<ManagedProcess> {
        let line_split = match config.mode {
            ProcessMode::Interactive => false,
            ProcessMode::Hybrid => true,
            ProcessMode::Structured => {
                return Err(EngineError::SpawnFailed(
                    "interactive manager cannot spawn structured processes".to_string(),
                ))
            }
        };

        let terminal = config.terminal.clone().unwrap_or_default();
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: terminal.rows,
                cols: terminal.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::SpawnFailed(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&config.executable);
        cmd.args(&config.args);
        if let Some(cwd) = terminal.cwd.as_ref().or(config.work_dir.as_ref()) {
            cmd.cwd(cwd);
        }
        if let Some(name) = &terminal.name {
            cmd.env("TERM", name);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        debug!(executable = %config.executable, "spawning terminal session");
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| EngineError::SpawnFailed("no process id assigned".to_string()))?;
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| EngineError::SpawnFailed(format!("pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| EngineError::SpawnFailed(format!("pty writer: {e}")))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let now = Instant::now();
        let entry = Arc::new(SessionEntry {
            id: Ulid::new().to_string(),
            pid,
            state: parking_lot::Mutex::new(SessionState {
                status: ProcessStatus::Spawning,
                spawned_at: now,
                last_activity: now,
                exit_code: None,
                killed: false,
                timed_out: false,
                tasks_completed: 0,
            }),
            output_handlers: parking_lot::RwLock::new(Vec::new()),
            error_handlers: parking_lot::RwLock::new(Vec::new()),
            writer: parking_lot::Mutex::new(Some(writer)),
            killer: parking_lot::Mutex::new(killer),
            _master: parking_lot::Mutex::new(pair.master),
            exit_rx,
        });

        self.sessions.insert(entry.id.clone(), Arc::clone(&entry));
        Self::spawn_reader(Arc::clone(&entry), reader, line_split);
        self.spawn_supervisor(Arc::clone(&entry), child, config.timeout, exit_tx);

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
        info!(session_id = %entry.id, pid, "terminal session spawned");

        Ok(entry.snapshot())
    }

    async fn release_process(&self, id: &str) -> Result<()> {
        self.terminate_process(id, None).await
    }

    async fn terminate_process(&self, id: &str, _signal: Option<Signal>) -> Result<()> {
        let Some(entry) = self.sessions.get(id).map(|e| Arc::clone(&e)) else {
            return Ok(());
        };

        {
            let mut state = entry.state.lock();
            if state.status.is_terminal() {
                return Ok(());
            }
            state.status = ProcessStatus::Terminating;
            state.killed = true;
        }

        // No graceful path on a pty; kill immediately.
        entry.kill_now();

        let mut exit_rx = entry.exit_rx.clone();
        let _ = tokio::time::timeout(TERMINATE_GRACE, exit_rx.wait_for(|e| e.is_some())).await;
        Ok(())
    }

    async fn send_input(&self, id: &str, data: &[u8]) -> Result<()> {
        let entry = self.entry(id)?;
        let mut writer = entry.writer.lock();
        let writer = writer
            .as_mut()
            .ok_or_else(|| EngineError::Os("terminal writer gone".to_string()))?;
        writer.write_all(data)?;
        writer.flush()?;
        entry.state.lock().last_activity = Instant::now();
        Ok(())
    }

    async fn close_input(&self, id: &str) -> Result<()> {
        // Input lifetime is tied to the session; closing it is meaningless.
        self.entry(id)?;
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
            .map_err(|_| EngineError::Os("session supervisor dropped".to_string()))?;
        Ok(exit.clone().expect("watch matched Some"))
    }

    fn get_process(&self, id: &str) -> Option<ManagedProcess> {
        self.sessions.get(id).map(|e| e.snapshot())
    }

    fn get_active_processes(&self) -> Vec<ManagedProcess> {
        self.sessions
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
        let ids: Vec<String> = self.sessions.iter().map(|e| e.id.clone()).collect();
        let terminations = ids.iter().map(|id| self.terminate_process(id, None));
        futures::future::join_all(terminations).await;
        self.sessions.clear();
        Ok(())
    }
}
