// src/main.rs
//! Foreman worker entrypoint
//!
//! The worker pool forks this binary once per execution, passing identity
//! through `FOREMAN_*` environment variables. Host applications that link
//! the library can dispatch into [`foreman_engine::pool::worker::run`] from
//! their own `main` instead and point the pool at themselves.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    foreman_engine::observability::init_tracing()?;
    foreman_engine::observability::init_metrics();

    let exit_code = foreman_engine::pool::worker::run().await?;
    std::process::exit(exit_code);
}
