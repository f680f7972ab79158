// src/process/limits.rs
//! Child-process resource setup
//!
//! Applied inside `pre_exec`, between fork and exec:
//!
//! - a new session/process group, so signal escalation reaches the whole
//!   process tree instead of orphaning grandchildren
//! - an optional address-space ceiling (`RLIMIT_AS`), so a runaway child is
//!   killed by the kernel instead of taking the host down
//!
//! Limits are enforced by the OS, never by the orchestrator polling usage.

use std::io;

/// Build the `pre_exec` body for a spawned child.
///
/// Must only be called from within `pre_exec`: between fork and exec only
/// async-signal-safe calls are allowed, which is why this uses raw `libc`
/// and no allocation.
pub(crate) fn child_setup(memory_limit_mb: Option<u64>) -> io::Result<()> {
    // New session: the child leads its own process group.
    // SAFETY: setsid is async-signal-safe.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    if let Some(limit_mb) = memory_limit_mb {
        let limit_bytes = limit_mb.saturating_mul(1024 * 1024);
        let rlim = libc::rlimit {
            rlim_cur: limit_bytes,
            rlim_max: limit_bytes,
        };
        // SAFETY: setrlimit is async-signal-safe; rlim outlives the call.
        if unsafe { libc::setrlimit(libc::RLIMIT_AS, &rlim) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}
