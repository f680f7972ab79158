// src/scheduler/mod.rs
//! Task scheduling engine
//!
//! Owns an ordered queue and a concurrency admission gate. Tasks drain in
//! priority order (higher first, FIFO on ties), re-evaluated every time a
//! slot frees up, and a task is dispatched only when a slot is free AND all
//! its dependencies completed. A task whose dependency fails or is cancelled
//! is auto-failed rather than left queued forever.
//!
//! The engine is bookkeeping only: actual work runs in processes owned by
//! the injected [`ProcessManager`].

pub mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::process::{ProcessConfig, ProcessManager};
use crate::utils::errors::{EngineError, Result};

pub use task::{ExecutionTask, TaskResult, TaskStatus};

/// Scheduling engine settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum tasks running at once
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// Engine-level queue/slot metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerMetrics {
    pub currently_running: usize,
    pub queued_tasks: usize,
    pub available_slots: usize,
    pub max_concurrent: usize,
}

/// Maps a task to the spawn parameters of its process
pub type LaunchFn = Arc<dyn Fn(&ExecutionTask) -> ProcessConfig + Send + Sync>;

/// Observer invoked exactly once per terminal transition
pub type TaskObserver = Arc<dyn Fn(&TaskResult) + Send + Sync>;

struct TaskEntry {
    task: Arc<ExecutionTask>,
    status: TaskStatus,
    seq: u64,
    process_id: Option<String>,
    started: Option<Instant>,
}

struct EngineState {
    tasks: HashMap<String, TaskEntry>,
    running: usize,
    seq: u64,
    on_complete: Vec<TaskObserver>,
    on_failed: Vec<TaskObserver>,
}

struct EngineInner {
    config: SchedulerConfig,
    manager: Arc<dyn ProcessManager>,
    launch: LaunchFn,
    state: parking_lot::Mutex<EngineState>,
}

/// Queue + concurrency admission over an injected process manager
#[derive(Clone)]
pub struct TaskSchedulingEngine {
    inner: Arc<EngineInner>,
}

impl TaskSchedulingEngine {
    pub fn new(config: SchedulerConfig, manager: Arc<dyn ProcessManager>, launch: LaunchFn) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                manager,
                launch,
                state: parking_lot::Mutex::new(EngineState {
                    tasks: HashMap::new(),
                    running: 0,
                    seq: 0,
                    on_complete: Vec::new(),
                    on_failed: Vec::new(),
                }),
            }),
        }
    }

    /// Enqueue one task; dispatches immediately when a slot is free and its
    /// dependencies are satisfied
    pub fn submit_task(&self, task: ExecutionTask) -> Result<()> {
        self.enqueue(task)?;
        self.dispatch();
        Ok(())
    }

    /// Enqueue a batch; inserted together so intra-batch dependencies are
    /// visible before the first dispatch decision
    pub fn submit_tasks(&self, tasks: Vec<ExecutionTask>) -> Result<()> {
        for task in tasks {
            self.enqueue(task)?;
        }
        self.dispatch();
        Ok(())
    }

    fn enqueue(&self, task: ExecutionTask) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.tasks.contains_key(&task.id) {
            return Err(EngineError::Os(format!("task {} already submitted", task.id)));
        }
        state.seq += 1;
        let seq = state.seq;
        debug!(task_id = %task.id, kind = %task.kind, priority = task.priority, "task queued");
        state.tasks.insert(
            task.id.clone(),
            TaskEntry {
                task: Arc::new(task),
                status: TaskStatus::Queued,
                seq,
                process_id: None,
                started: None,
            },
        );
        Ok(())
    }

    /// Idempotent, safe for any state: queued tasks are removed without ever
    /// touching the process manager; running tasks get exactly one
    /// termination call and free their slot immediately
    pub async fn cancel_task(&self, id: &str) -> Result<()> {
        let (process_id, cascaded) = {
            let mut state = self.inner.state.lock();
            let Some(status) = state.tasks.get(id).map(|e| e.status) else {
                return Ok(());
            };

            match status {
                TaskStatus::Queued => {
                    state.tasks.remove(id);
                    debug!(task_id = %id, "cancelled queued task");
                    (None, self.fail_dependents_locked(&mut state, id))
                }
                TaskStatus::Running => {
                    let process_id = state.tasks.remove(id).and_then(|e| e.process_id);
                    state.running -= 1;
                    debug!(task_id = %id, "cancelled running task");
                    (process_id, self.fail_dependents_locked(&mut state, id))
                }
                // Terminal states: nothing to do.
                _ => return Ok(()),
            }
        };

        self.notify_failed(&cascaded);
        if let Some(process_id) = process_id {
            self.inner
                .manager
                .terminate_process(&process_id, None)
                .await?;
        }
        self.dispatch();
        Ok(())
    }

    /// Current status, or `None` for unknown or already-cleared tasks —
    /// cancellation and shutdown both clear task records
    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.inner.state.lock().tasks.get(id).map(|e| e.status)
    }

    pub fn get_metrics(&self) -> SchedulerMetrics {
        let state = self.inner.state.lock();
        let queued = state
            .tasks
            .values()
            .filter(|e| e.status == TaskStatus::Queued)
            .count();
        SchedulerMetrics {
            currently_running: state.running,
            queued_tasks: queued,
            available_slots: self.inner.config.max_concurrent.saturating_sub(state.running),
            max_concurrent: self.inner.config.max_concurrent,
        }
    }

    /// Register a completion observer; cleared on shutdown
    pub fn on_task_complete(&self, observer: TaskObserver) {
        self.inner.state.lock().on_complete.push(observer);
    }

    /// Register a failure observer; cleared on shutdown
    pub fn on_task_failed(&self, observer: TaskObserver) {
        self.inner.state.lock().on_failed.push(observer);
    }

    /// Cancel all running tasks, clear the queue and all observers, then
    /// shut the process manager down. Idempotent; completes promptly by
    /// terminating in-flight processes instead of waiting them out.
    pub async fn shutdown(&self) -> Result<()> {
        let process_ids: Vec<String> = {
            let mut state = self.inner.state.lock();
            let pids = state
                .tasks
                .values()
                .filter_map(|e| e.process_id.clone())
                .collect();
            state.tasks.clear();
            state.running = 0;
            state.on_complete.clear();
            state.on_failed.clear();
            pids
        };

        info!(terminating = process_ids.len(), "scheduler shutting down");
        let terminations = process_ids
            .iter()
            .map(|pid| self.inner.manager.terminate_process(pid, None));
        futures::future::join_all(terminations).await;
        self.inner.manager.shutdown().await?;
        metrics::gauge!("foreman_tasks_running").set(0.0);
        Ok(())
    }

    /// Fill free slots with eligible queued tasks
    fn dispatch(&self) {
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                if state.running >= self.inner.config.max_concurrent {
                    break;
                }

                let eligible = state
                    .tasks
                    .values()
                    .filter(|e| e.status == TaskStatus::Queued)
                    .filter(|e| {
                        e.task.dependencies.iter().all(|dep| {
                            state
                                .tasks
                                .get(dep)
                                .is_some_and(|d| d.status == TaskStatus::Completed)
                        })
                    })
                    // Priority first, submission order on ties.
                    .max_by_key(|e| (e.task.priority, std::cmp::Reverse(e.seq)))
                    .map(|e| e.task.id.clone());

                let Some(id) = eligible else { break };
                let entry = state.tasks.get_mut(&id).expect("selected task exists");
                entry.status = TaskStatus::Running;
                entry.started = Some(Instant::now());
                state.running += 1;
                metrics::gauge!("foreman_tasks_running").set(state.running as f64);
                Arc::clone(&entry.task)
            };

            let engine = self.clone();
            tokio::spawn(async move {
                engine.drive(next).await;
            });
        }
    }

    /// Run one task to its terminal state
    async fn drive(&self, task: Arc<ExecutionTask>) {
        let config = (self.inner.launch)(&task);
        debug!(task_id = %task.id, executable = %config.executable, "dispatching task");

        let process = match self.inner.manager.acquire_process(config).await {
            Ok(process) => process,
            Err(e) => {
                warn!(task_id = %task.id, err = %e, "failed to start task process");
                self.finish(&task.id, TaskStatus::Failed, None, Some(e.to_string()));
                return;
            }
        };

        // Publish the process id so cancellation can reach it; if the task
        // was cancelled while spawning, tear the orphan down ourselves.
        let cancelled = {
            let mut state = self.inner.state.lock();
            match state.tasks.get_mut(&task.id) {
                Some(entry) if entry.status == TaskStatus::Running => {
                    entry.process_id = Some(process.id.clone());
                    false
                }
                _ => true,
            }
        };
        if cancelled {
            let _ = self.inner.manager.terminate_process(&process.id, None).await;
            self.dispatch();
            return;
        }

        match self.inner.manager.wait_for_exit(&process.id).await {
            Ok(exit) if exit.success() => {
                self.finish(&task.id, TaskStatus::Completed, exit.code, None);
            }
            Ok(exit) => {
                let reason = match (exit.code, exit.signal) {
                    (Some(code), _) => format!("process exited with code {code}"),
                    (None, Some(signal)) => format!("process killed by signal {signal}"),
                    (None, None) => "process crashed".to_string(),
                };
                self.finish(&task.id, TaskStatus::Failed, exit.code, Some(reason));
            }
            Err(e) => {
                self.finish(&task.id, TaskStatus::Failed, None, Some(e.to_string()));
            }
        }
    }

    /// Record a terminal transition, notify observers once, cascade to
    /// dependents on failure, then refill slots
    fn finish(&self, id: &str, status: TaskStatus, exit_code: Option<i32>, reason: Option<String>) {
        let (result, observers, cascaded) = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.tasks.get_mut(id) else {
                // Cancelled or shut down mid-flight; slot already released.
                drop(state);
                self.dispatch();
                return;
            };

            entry.status = status;
            entry.process_id = None;
            let duration = entry
                .started
                .map(|s| s.elapsed())
                .unwrap_or_default();
            let result = TaskResult {
                task_id: entry.task.id.clone(),
                kind: entry.task.kind.clone(),
                status,
                exit_code,
                reason,
                duration,
            };

            state.running -= 1;
            metrics::gauge!("foreman_tasks_running").set(state.running as f64);

            let observers = match status {
                TaskStatus::Completed => state.on_complete.clone(),
                _ => state.on_failed.clone(),
            };
            let cascaded = if status == TaskStatus::Failed {
                self.fail_dependents_locked(&mut state, id)
            } else {
                Vec::new()
            };
            (result, observers, cascaded)
        };

        match result.status {
            TaskStatus::Completed => {
                metrics::counter!("foreman_tasks_completed_total").increment(1);
                debug!(task_id = %id, "task completed");
            }
            _ => {
                metrics::counter!("foreman_tasks_failed_total").increment(1);
                debug!(task_id = %id, reason = ?result.reason, "task failed");
            }
        }

        for observer in &observers {
            observer(&result);
        }
        self.notify_failed(&cascaded);
        self.dispatch();
    }

    /// Auto-fail every queued task depending (transitively) on a task that
    /// failed or was cancelled
    fn fail_dependents_locked(&self, state: &mut EngineState, root: &str) -> Vec<TaskResult> {
        let mut results = Vec::new();
        let mut worklist = vec![root.to_string()];

        while let Some(failed_id) = worklist.pop() {
            let dependents: Vec<String> = state
                .tasks
                .values()
                .filter(|e| e.status == TaskStatus::Queued)
                .filter(|e| e.task.dependencies.contains(&failed_id))
                .map(|e| e.task.id.clone())
                .collect();

            for dep_id in dependents {
                let entry = state.tasks.get_mut(&dep_id).expect("dependent exists");
                entry.status = TaskStatus::Failed;
                warn!(task_id = %dep_id, dependency = %failed_id, "failing dependent task");
                results.push(TaskResult {
                    task_id: dep_id.clone(),
                    kind: entry.task.kind.clone(),
                    status: TaskStatus::Failed,
                    exit_code: None,
                    reason: Some(format!("dependency {failed_id} did not complete")),
                    duration: Default::default(),
                });
                worklist.push(dep_id);
            }
        }

        results
    }

    fn notify_failed(&self, results: &[TaskResult]) {
        if results.is_empty() {
            return;
        }
        let observers = self.inner.state.lock().on_failed.clone();
        for result in results {
            metrics::counter!("foreman_tasks_failed_total").increment(1);
            for observer in &observers {
                observer(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{
        ManagedProcess, ManagerMetrics, OutputHandler, ProcessExit, ProcessMetrics, ProcessStatus,
    };
    use async_trait::async_trait;
    use dashmap::DashMap;
    use nix::sys::signal::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};

    /// In-memory manager: `args[0]` is a label, `args[1]` is a behavior
    /// string (`ok:<ms>` or `fail:<ms>`).
    struct MockManager {
        active: Arc<AtomicUsize>,
        peak: AtomicUsize,
        acquired: parking_lot::Mutex<Vec<String>>,
        terminations: AtomicUsize,
        exits: DashMap<String, watch::Receiver<Option<ProcessExit>>>,
        senders: Arc<DashMap<String, watch::Sender<Option<ProcessExit>>>>,
    }

    impl MockManager {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: Arc::new(AtomicUsize::new(0)),
                peak: AtomicUsize::new(0),
                acquired: parking_lot::Mutex::new(Vec::new()),
                terminations: AtomicUsize::new(0),
                exits: DashMap::new(),
                senders: Arc::new(DashMap::new()),
            })
        }

        fn launch_fn() -> LaunchFn {
            Arc::new(|task: &ExecutionTask| ProcessConfig {
                executable: "mock".to_string(),
                args: vec![
                    task.id.clone(),
                    task.config
                        .as_str()
                        .unwrap_or("ok:20")
                        .to_string(),
                ],
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl ProcessManager for MockManager {
        async fn acquire_process(&self, config: ProcessConfig) -> crate::utils::errors::Result<ManagedProcess> {
            let behavior = config.args[1].clone();
            self.acquired.lock().push(config.args[0].clone());

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let (tx, rx) = watch::channel(None);
            let id = ulid::Ulid::new().to_string();
            self.exits.insert(id.clone(), rx);
            self.senders.insert(id.clone(), tx);

            let (kind, ms) = behavior.split_once(':').unwrap_or(("ok", "20"));
            let delay = Duration::from_millis(ms.parse().unwrap_or(20));
            let code = if kind == "ok" { 0 } else { 1 };

            let senders = Arc::clone(&self.senders);
            let active = Arc::clone(&self.active);
            let exit_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                active.fetch_sub(1, Ordering::SeqCst);
                if let Some(sender) = senders.get(&exit_id) {
                    let _ = sender.send(Some(ProcessExit {
                        code: Some(code),
                        signal: None,
                        status: ProcessStatus::Completed,
                        duration: delay,
                    }));
                }
            });

            let instant = std::time::Instant::now();
            Ok(ManagedProcess {
                id,
                pid: 1,
                status: ProcessStatus::Busy,
                spawned_at: instant,
                last_activity: instant,
                exit_code: None,
                signal: None,
                metrics: ProcessMetrics::default(),
            })
        }

        async fn release_process(&self, id: &str) -> crate::utils::errors::Result<()> {
            self.terminate_process(id, None).await
        }

        async fn terminate_process(&self, id: &str, _signal: Option<Signal>) -> crate::utils::errors::Result<()> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            if let Some(sender) = self.senders.get(id) {
                self.active.fetch_sub(1, Ordering::SeqCst);
                let _ = sender.send(Some(ProcessExit {
                    code: None,
                    signal: Some(15),
                    status: ProcessStatus::Crashed,
                    duration: Duration::ZERO,
                }));
            }
            Ok(())
        }

        async fn send_input(&self, _id: &str, _data: &[u8]) -> crate::utils::errors::Result<()> {
            Ok(())
        }

        async fn close_input(&self, _id: &str) -> crate::utils::errors::Result<()> {
            Ok(())
        }

        fn on_output(&self, _id: &str, _handler: OutputHandler) -> crate::utils::errors::Result<()> {
            Ok(())
        }

        fn on_error(
            &self,
            _id: &str,
            _handler: crate::process::ErrorHandler,
        ) -> crate::utils::errors::Result<()> {
            Ok(())
        }

        async fn wait_for_exit(&self, id: &str) -> crate::utils::errors::Result<ProcessExit> {
            let mut rx = self
                .exits
                .get(id)
                .map(|r| r.value().clone())
                .ok_or_else(|| EngineError::ProcessNotFound(id.to_string()))?;
            let exit = rx.wait_for(|e| e.is_some()).await.unwrap();
            Ok(exit.clone().unwrap())
        }

        fn get_process(&self, _id: &str) -> Option<ManagedProcess> {
            None
        }

        fn get_active_processes(&self) -> Vec<ManagedProcess> {
            Vec::new()
        }

        fn get_metrics(&self) -> ManagerMetrics {
            ManagerMetrics::default()
        }

        async fn shutdown(&self) -> crate::utils::errors::Result<()> {
            Ok(())
        }
    }

    fn engine_with(max_concurrent: usize, manager: Arc<MockManager>) -> TaskSchedulingEngine {
        TaskSchedulingEngine::new(
            SchedulerConfig { max_concurrent },
            manager,
            MockManager::launch_fn(),
        )
    }

    fn behavior_task(kind: &str, behavior: &str) -> ExecutionTask {
        let mut task = ExecutionTask::new(kind, "do the thing");
        task.config = serde_json::Value::String(behavior.to_string());
        task
    }

    async fn wait_until_drained(engine: &TaskSchedulingEngine) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let m = engine.get_metrics();
                if m.currently_running == 0 && m.queued_tasks == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("engine drained");
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_never_exceeded() {
        let manager = MockManager::new();
        let engine = engine_with(2, Arc::clone(&manager));

        let tasks: Vec<_> = (0..6).map(|_| behavior_task("issue", "ok:30")).collect();
        engine.submit_tasks(tasks).unwrap();
        assert!(engine.get_metrics().currently_running <= 2);

        wait_until_drained(&engine).await;
        assert!(manager.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(manager.acquired.lock().len(), 6);
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let manager = MockManager::new();
        let engine = engine_with(1, Arc::clone(&manager));

        let low = behavior_task("issue", "ok:10").with_priority(1);
        let high = behavior_task("issue", "ok:10").with_priority(9);
        let mid_a = behavior_task("issue", "ok:10").with_priority(5);
        let mid_b = behavior_task("issue", "ok:10").with_priority(5);

        let expected = vec![
            high.id.clone(),
            mid_a.id.clone(),
            mid_b.id.clone(),
            low.id.clone(),
        ];
        engine
            .submit_tasks(vec![low, high, mid_a, mid_b])
            .unwrap();
        wait_until_drained(&engine).await;

        assert_eq!(*manager.acquired.lock(), expected);
        let metrics = engine.get_metrics();
        assert_eq!(metrics.queued_tasks, 0);
        assert_eq!(metrics.currently_running, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_never_touches_manager() {
        let manager = MockManager::new();
        let engine = engine_with(1, Arc::clone(&manager));

        let running = behavior_task("issue", "ok:100");
        let queued = behavior_task("issue", "ok:10");
        let queued_id = queued.id.clone();
        engine.submit_tasks(vec![running, queued]).unwrap();

        engine.cancel_task(&queued_id).await.unwrap();
        assert!(engine.task_status(&queued_id).is_none());

        wait_until_drained(&engine).await;
        assert_eq!(manager.acquired.lock().len(), 1);
        assert_eq!(manager.terminations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_terminates_once_and_frees_slot() {
        let manager = MockManager::new();
        let engine = engine_with(1, Arc::clone(&manager));

        let long = behavior_task("issue", "ok:60000");
        let long_id = long.id.clone();
        let next = behavior_task("issue", "ok:10");
        let next_id = next.id.clone();

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        engine.on_task_complete(Arc::new(move |result| {
            let _ = done_tx.send(result.task_id.clone());
        }));

        engine.submit_tasks(vec![long, next]).unwrap();

        // Let the long task actually start before cancelling it.
        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.task_status(&long_id) != Some(TaskStatus::Running) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        engine.cancel_task(&long_id).await.unwrap();
        // Cancelling twice is a no-op.
        engine.cancel_task(&long_id).await.unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed, next_id);
        assert_eq!(manager.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dependencies_gate_dispatch() {
        let manager = MockManager::new();
        let engine = engine_with(4, Arc::clone(&manager));

        let first = behavior_task("issue", "ok:20");
        let second = behavior_task("issue", "ok:10")
            .with_priority(100)
            .with_dependency(first.id.clone());
        let expected = vec![first.id.clone(), second.id.clone()];

        engine.submit_tasks(vec![second, first]).unwrap();
        wait_until_drained(&engine).await;

        // Despite the higher priority, the dependent ran second.
        assert_eq!(*manager.acquired.lock(), expected);
    }

    #[tokio::test]
    async fn test_failed_dependency_cascades() {
        let manager = MockManager::new();
        let engine = engine_with(2, Arc::clone(&manager));

        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        engine.on_task_failed(Arc::new(move |result| {
            let _ = failed_tx.send((result.task_id.clone(), result.reason.clone()));
        }));

        let failing = behavior_task("issue", "fail:10");
        let dependent = behavior_task("issue", "ok:10").with_dependency(failing.id.clone());
        let grandchild = behavior_task("issue", "ok:10").with_dependency(dependent.id.clone());

        let failing_id = failing.id.clone();
        let dependent_id = dependent.id.clone();
        let grandchild_id = grandchild.id.clone();
        engine
            .submit_tasks(vec![failing, dependent, grandchild])
            .unwrap();
        wait_until_drained(&engine).await;

        let mut failed = Vec::new();
        while let Ok(item) = failed_rx.try_recv() {
            failed.push(item);
        }
        let ids: Vec<_> = failed.iter().map(|(id, _)| id.clone()).collect();
        assert!(ids.contains(&failing_id));
        assert!(ids.contains(&dependent_id));
        assert!(ids.contains(&grandchild_id));
        assert_eq!(manager.acquired.lock().len(), 1);

        let cascade_reason = failed
            .iter()
            .find(|(id, _)| *id == dependent_id)
            .and_then(|(_, reason)| reason.clone())
            .unwrap();
        assert!(cascade_reason.contains(&failing_id));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_clears_everything() {
        let manager = MockManager::new();
        let engine = engine_with(1, Arc::clone(&manager));

        let called = Arc::new(AtomicUsize::new(0));
        let observer_calls = Arc::clone(&called);
        engine.on_task_complete(Arc::new(move |_| {
            observer_calls.fetch_add(1, Ordering::SeqCst);
        }));

        engine
            .submit_tasks(vec![
                behavior_task("issue", "ok:60000"),
                behavior_task("issue", "ok:60000"),
            ])
            .unwrap();

        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();

        let metrics = engine.get_metrics();
        assert_eq!(metrics.currently_running, 0);
        assert_eq!(metrics.queued_tasks, 0);
        // Observers were cleared before anything could complete.
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_serialized_execution_end_to_end() {
        let manager = MockManager::new();
        let engine = engine_with(1, Arc::clone(&manager));

        let a = behavior_task("issue", "ok:10").with_priority(1);
        let b = behavior_task("issue", "ok:10").with_priority(3);
        let c = behavior_task("issue", "ok:10").with_priority(2);
        let expected = vec![b.id.clone(), c.id.clone(), a.id.clone()];

        engine.submit_tasks(vec![a, b, c]).unwrap();
        wait_until_drained(&engine).await;

        assert_eq!(*manager.acquired.lock(), expected);
        assert_eq!(manager.peak.load(Ordering::SeqCst), 1);
        let metrics = engine.get_metrics();
        assert_eq!(metrics.queued_tasks, 0);
        assert_eq!(metrics.currently_running, 0);
    }
}
