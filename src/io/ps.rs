//! PID liveness checks and graceful process termination.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

/// Check whether a given PID is alive.
///
/// Uses `kill(pid, 0)`, which checks for process existence without sending a
/// signal. EPERM means the process exists but belongs to another user; that
/// counts as alive so stale-lock detection fails closed.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid_i32, 0) };
        if result == 0 {
            return true;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        errno == libc::EPERM
    }
    #[cfg(not(unix))]
    {
        let _ = pid_i32;
        // No cheap liveness check available; assume alive so we never steal a lock.
        true
    }
}

fn send_signal(pid: u32, signal: i32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid_i32, signal) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid_i32, signal);
        false
    }
}

/// Ask a process to exit with SIGTERM, escalating to SIGKILL after `grace`.
///
/// Returns once the process is gone (or was never alive). Best-effort: a
/// process we cannot signal is reported via the error.
pub fn terminate_with_grace(pid: u32, grace: Duration) -> Result<()> {
    if !is_pid_alive(pid) {
        return Ok(());
    }
    #[cfg(unix)]
    let term = libc::SIGTERM;
    #[cfg(not(unix))]
    let term = 15;
    debug!(pid, "sending SIGTERM");
    send_signal(pid, term);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_pid_alive(pid) {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }

    #[cfg(unix)]
    let kill = libc::SIGKILL;
    #[cfg(not(unix))]
    let kill = 9;
    warn!(pid, "grace period elapsed, sending SIGKILL");
    send_signal(pid, kill);

    // Give the kernel a moment to reap before reporting.
    thread::sleep(Duration::from_millis(200));
    Ok(())
}
