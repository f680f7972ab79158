// src/pool/worker.rs
//! Worker-process side of the pool
//!
//! Runs inside the isolated process forked per execution. Reads its identity
//! from `FOREMAN_*` environment variables, emits a `ready` frame, then
//! drives the agent executable through a process manager wrapped in the
//! resilience layer. Agent output is forwarded upstream as `log`/`event`
//! frames; parent commands (`cancel`, `shutdown`, `ping`) arrive on stdin.
//!
//! Stdout carries only protocol frames. Logging goes to stderr, which the
//! parent forwards to its log observers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::ipc::{
    self, ParentMessage, WorkerMessage, ENV_DB_PATH, ENV_EXECUTION_ID, ENV_MEMORY_LIMIT_MB,
    ENV_PROJECT_ID, ENV_REPO_PATH, ENV_WORKER_ID,
};
use crate::process::{
    InteractiveProcessManager, OutputStream, ProcessConfig, ProcessManager, ProcessMode,
    StructuredProcessManager, TerminalConfig,
};
use crate::resilience::{
    AttemptFailure, CircuitBreakerConfig, CircuitBreakerRegistry, ResilienceWrapper,
};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};

const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Identity handed to the worker via environment variables
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub execution_id: String,
    pub project_id: String,
    pub repo_path: PathBuf,
    pub db_path: PathBuf,
    pub worker_id: String,
    pub memory_limit_mb: Option<u64>,
}

impl WorkerIdentity {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse identity from an arbitrary lookup, for testability
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            get(key).ok_or_else(|| EngineError::WorkerEnv(format!("missing {key}")))
        };

        let memory_limit_mb = get(ENV_MEMORY_LIMIT_MB)
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| {
                    EngineError::WorkerEnv(format!("{ENV_MEMORY_LIMIT_MB} is not a number: {raw}"))
                })
            })
            .transpose()?;

        Ok(Self {
            execution_id: required(ENV_EXECUTION_ID)?,
            project_id: required(ENV_PROJECT_ID)?,
            repo_path: PathBuf::from(required(ENV_REPO_PATH)?),
            db_path: PathBuf::from(required(ENV_DB_PATH)?),
            worker_id: required(ENV_WORKER_ID)?,
            memory_limit_mb,
        })
    }
}

/// Serialized frame writer over stdout
pub struct FrameWriter {
    out: tokio::sync::Mutex<tokio::io::Stdout>,
}

impl FrameWriter {
    pub fn stdout() -> Arc<Self> {
        Arc::new(Self {
            out: tokio::sync::Mutex::new(tokio::io::stdout()),
        })
    }

    pub async fn send(&self, message: &WorkerMessage) -> Result<()> {
        let line = ipc::encode(message)?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

/// Turn one line of agent output into its upstream frame.
///
/// Lines that parse as a JSON object carrying a `type` field are treated as
/// agent-protocol events and passed through verbatim; everything else
/// becomes a log frame. Blank lines are dropped.
fn frame_for_output(chunk: &[u8], stream: OutputStream) -> Option<WorkerMessage> {
    let text = String::from_utf8_lossy(chunk);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if stream == OutputStream::Stderr {
        return Some(WorkerMessage::Log {
            level: "warn".to_string(),
            message: trimmed.to_string(),
        });
    }

    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
            if map.contains_key("type") {
                return Some(WorkerMessage::Event {
                    payload: serde_json::Value::Object(map),
                });
            }
        }
    }

    Some(WorkerMessage::Log {
        level: "info".to_string(),
        message: trimmed.to_string(),
    })
}

/// Worker entrypoint: identity from env, engine config from disk/env.
///
/// Returns the process exit code: 0 for success, 1 for an application-level
/// failure (including cancellation).
pub async fn run() -> Result<i32> {
    let identity = WorkerIdentity::from_env()?;
    let config = EngineConfig::load()?;
    run_with(identity, config).await
}

/// Worker loop with explicit inputs
pub async fn run_with(identity: WorkerIdentity, config: EngineConfig) -> Result<i32> {
    info!(
        execution_id = %identity.execution_id,
        worker_id = %identity.worker_id,
        "worker initializing"
    );

    let frames = FrameWriter::stdout();
    let token = CancellationToken::new();
    let graceful = Arc::new(AtomicBool::new(false));

    spawn_command_listener(Arc::clone(&frames), token.clone(), Arc::clone(&graceful));

    let mode = match config.agent.mode.as_str() {
        "interactive" => ProcessMode::Interactive,
        "hybrid" => ProcessMode::Hybrid,
        _ => ProcessMode::Structured,
    };
    let manager: Arc<dyn ProcessManager> = match mode {
        ProcessMode::Structured => Arc::new(StructuredProcessManager::new()),
        _ => Arc::new(InteractiveProcessManager::new()),
    };

    frames.send(&WorkerMessage::Ready).await?;

    // Output handlers are synchronous; bridge them into async frame writes.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(Vec<u8>, OutputStream)>();
    {
        let frames = Arc::clone(&frames);
        tokio::spawn(async move {
            while let Some((chunk, stream)) = out_rx.recv().await {
                if let Some(frame) = frame_for_output(&chunk, stream) {
                    let _ = frames.send(&frame).await;
                }
            }
        });
    }

    let wrapper = ResilienceWrapper::new(
        config.retry.to_policy(),
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
    );

    let agent = config.agent.clone();
    let attempt_identity = identity.clone();
    let attempt_frames = Arc::clone(&frames);
    let attempt_manager = Arc::clone(&manager);
    let result = wrapper
        .execute("agent", |attempt_number| {
            let manager = Arc::clone(&attempt_manager);
            let frames = Arc::clone(&attempt_frames);
            let token = token.clone();
            let out_tx = out_tx.clone();
            let agent = agent.clone();
            let identity = attempt_identity.clone();

            async move {
                if token.is_cancelled() {
                    return Err(AttemptFailure::new("execution cancelled"));
                }
                let _ = frames
                    .send(&WorkerMessage::Status {
                        phase: format!("attempt {attempt_number}"),
                    })
                    .await;

                let mut env = HashMap::new();
                env.insert(ENV_EXECUTION_ID.to_string(), identity.execution_id.clone());
                env.insert(ENV_PROJECT_ID.to_string(), identity.project_id.clone());
                env.insert(
                    ENV_REPO_PATH.to_string(),
                    identity.repo_path.display().to_string(),
                );
                env.insert(
                    ENV_DB_PATH.to_string(),
                    identity.db_path.display().to_string(),
                );
                env.insert(ENV_WORKER_ID.to_string(), identity.worker_id.clone());

                let process_config = ProcessConfig {
                    executable: agent.bin.clone(),
                    args: agent.args.clone(),
                    work_dir: Some(identity.repo_path.clone()),
                    env,
                    timeout: (agent.timeout_secs > 0)
                        .then(|| Duration::from_secs(agent.timeout_secs)),
                    mode,
                    terminal: (mode != ProcessMode::Structured).then(TerminalConfig::default),
                    ..Default::default()
                };

                let process = manager
                    .acquire_process(process_config)
                    .await
                    .map_err(|e| AttemptFailure::new(e.to_string()))?;
                manager
                    .on_output(
                        &process.id,
                        Arc::new(move |chunk, stream| {
                            let _ = out_tx.send((chunk.to_vec(), stream));
                        }),
                    )
                    .map_err(|e| AttemptFailure::new(e.to_string()))?;

                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("cancel received, terminating agent process");
                        let _ = manager.terminate_process(&process.id, None).await;
                        Err(AttemptFailure::new("execution cancelled"))
                    }
                    exit = manager.wait_for_exit(&process.id) => match exit {
                        Ok(exit) if exit.success() => Ok(serde_json::json!({
                            "exit_code": 0,
                            "duration_ms": exit.duration.as_millis() as u64,
                        })),
                        Ok(exit) => {
                            let message = match (exit.code, exit.signal) {
                                (Some(code), _) => format!("agent exited with code {code}"),
                                (None, Some(signal)) => {
                                    format!("agent killed by signal {signal}")
                                }
                                (None, None) => "agent crashed".to_string(),
                            };
                            Err(match exit.code {
                                Some(code) => AttemptFailure::with_exit_code(message, code),
                                None => AttemptFailure::new(message),
                            })
                        }
                        Err(e) => Err(AttemptFailure::new(e.to_string())),
                    }
                }
            }
        })
        .await;

    frames
        .send(&WorkerMessage::Status {
            phase: "completing".to_string(),
        })
        .await?;

    let exit_code = match result.value {
        Some(value) => {
            frames
                .send(&WorkerMessage::Complete {
                    result: serde_json::json!({
                        "result": value,
                        "attempts": result.attempts,
                        "total_attempts": result.total_attempts,
                    }),
                })
                .await?;
            0
        }
        None if token.is_cancelled() && !graceful.load(Ordering::SeqCst) => {
            frames
                .send(&WorkerMessage::Error {
                    message: "execution cancelled".to_string(),
                    fatal: false,
                })
                .await?;
            1
        }
        None => {
            frames
                .send(&WorkerMessage::Error {
                    message: result
                        .failure_reason
                        .unwrap_or_else(|| "execution failed".to_string()),
                    fatal: result.circuit_breaker_triggered,
                })
                .await?;
            1
        }
    };

    manager.shutdown().await?;
    info!(exit_code, "worker finished");
    Ok(exit_code)
}

/// Listen for parent commands on stdin
fn spawn_command_listener(
    frames: Arc<FrameWriter>,
    token: CancellationToken,
    graceful: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = FramedRead::new(stdin, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
        while let Some(Ok(line)) = lines.next().await {
            match ipc::decode_parent(&line) {
                Some(ParentMessage::Cancel) => {
                    info!("cancel requested by parent");
                    token.cancel();
                }
                Some(ParentMessage::Shutdown) => {
                    info!("graceful shutdown requested by parent");
                    graceful.store(true, Ordering::SeqCst);
                    token.cancel();
                }
                Some(ParentMessage::Ping) => {
                    let _ = frames.send(&WorkerMessage::Pong).await;
                }
                // Unknown frames are logged and dropped by the decoder.
                None => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_env() -> HashMap<String, String> {
        HashMap::from([
            (ENV_EXECUTION_ID.to_string(), "exec-1".to_string()),
            (ENV_PROJECT_ID.to_string(), "proj-1".to_string()),
            (ENV_REPO_PATH.to_string(), "/tmp/repo".to_string()),
            (ENV_DB_PATH.to_string(), "/tmp/db.sqlite".to_string()),
            (ENV_WORKER_ID.to_string(), "worker-1".to_string()),
            (ENV_MEMORY_LIMIT_MB.to_string(), "2048".to_string()),
        ])
    }

    #[test]
    fn test_identity_from_complete_environment() {
        let env = full_env();
        let identity = WorkerIdentity::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(identity.execution_id, "exec-1");
        assert_eq!(identity.repo_path, PathBuf::from("/tmp/repo"));
        assert_eq!(identity.memory_limit_mb, Some(2048));
    }

    #[test]
    fn test_identity_names_the_missing_variable() {
        let mut env = full_env();
        env.remove(ENV_DB_PATH);
        let err = WorkerIdentity::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains(ENV_DB_PATH));
    }

    #[test]
    fn test_identity_rejects_bad_memory_limit() {
        let mut env = full_env();
        env.insert(ENV_MEMORY_LIMIT_MB.to_string(), "lots".to_string());
        let err = WorkerIdentity::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, EngineError::WorkerEnv(_)));
    }

    #[test]
    fn test_memory_limit_is_optional() {
        let mut env = full_env();
        env.remove(ENV_MEMORY_LIMIT_MB);
        let identity = WorkerIdentity::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(identity.memory_limit_mb, None);
    }

    #[test]
    fn test_agent_protocol_lines_become_events() {
        let frame = frame_for_output(
            br#"{"type":"tool_use","tool":"editor"}"#,
            OutputStream::Stdout,
        );
        assert!(matches!(frame, Some(WorkerMessage::Event { .. })));
    }

    #[test]
    fn test_plain_lines_become_logs() {
        let frame = frame_for_output(b"compiling crate foo\n", OutputStream::Stdout);
        match frame {
            Some(WorkerMessage::Log { level, message }) => {
                assert_eq!(level, "info");
                assert_eq!(message, "compiling crate foo");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_json_without_type_is_a_log() {
        let frame = frame_for_output(br#"{"progress": 42}"#, OutputStream::Stdout);
        assert!(matches!(frame, Some(WorkerMessage::Log { .. })));
    }

    #[test]
    fn test_stderr_lines_become_warnings() {
        let frame = frame_for_output(b"something looks off\n", OutputStream::Stderr);
        match frame {
            Some(WorkerMessage::Log { level, .. }) => assert_eq!(level, "warn"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_blank_lines_are_dropped() {
        assert!(frame_for_output(b"\n", OutputStream::Stdout).is_none());
        assert!(frame_for_output(b"   \n", OutputStream::Stderr).is_none());
    }
}
