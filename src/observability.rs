// src/observability.rs
//! Tracing and metrics initialization
//!
//! All log output goes to stderr: worker processes keep stdout reserved for
//! the JSON-lines IPC protocol, and the parent reads it frame by frame.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::utils::errors::Result;

static TRACING: OnceCell<()> = OnceCell::new();
static METRICS: OnceCell<()> = OnceCell::new();

/// Initialize the tracing subscriber. Idempotent.
///
/// Filtering is controlled by `RUST_LOG`; defaults to `info`.
pub fn init_tracing() -> Result<()> {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });

    Ok(())
}

/// Register metric descriptions. Idempotent.
///
/// The engine only emits through the `metrics` facade; wiring an exporter is
/// the embedding application's job.
pub fn init_metrics() {
    METRICS.get_or_init(|| {
        metrics::describe_counter!(
            "foreman_processes_spawned_total",
            "Processes spawned by the process managers"
        );
        metrics::describe_counter!(
            "foreman_processes_crashed_total",
            "Processes that exited on a signal or timeout"
        );
        metrics::describe_counter!(
            "foreman_tasks_completed_total",
            "Tasks that reached completed status"
        );
        metrics::describe_counter!(
            "foreman_tasks_failed_total",
            "Tasks that reached failed status"
        );
        metrics::describe_counter!(
            "foreman_circuit_opened_total",
            "Circuit breaker open transitions"
        );
        metrics::describe_counter!(
            "foreman_workers_crashed_total",
            "Worker processes killed by a signal or the OOM killer"
        );
        metrics::describe_gauge!(
            "foreman_tasks_running",
            "Tasks currently holding a concurrency slot"
        );
        metrics::describe_gauge!(
            "foreman_workers_active",
            "Worker processes currently alive"
        );
    });
}
