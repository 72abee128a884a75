//! OS-level process helpers addressed by pid.
//!
//! Used for processes this supervisor did not spawn itself (records left by
//! an earlier run) and for liveness checks. On unix these are `kill(2)`
//! calls through `nix`; on Windows they shell out to `tasklist`/`taskkill`.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Interval between liveness checks while waiting for an exit.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time allowed for a forced kill to take effect.
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Liveness
// ============================================================================

/// Returns `true` if `pid` refers to a running, non-zombie process.
#[cfg(unix)]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(pid) = to_nix_pid(pid) else {
        return false;
    };

    match kill(pid, None) {
        Ok(()) => !is_zombie(pid.as_raw()),
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Returns `true` if `pid` refers to a running process.
#[cfg(windows)]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    let filter = format!("PID eq {pid}");
    match std::process::Command::new("tasklist")
        .args(["/FI", &filter, "/NH", "/FO", "CSV"])
        .output()
    {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{pid}\"")),
        Err(e) => {
            debug!(pid, error = %e, "tasklist failed");
            false
        }
    }
}

#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(nix::unistd::Pid::from_raw(raw)),
        _ => None,
    }
}

/// Linux keeps exited-but-unreaped children in state `Z`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: i32) -> bool {
    false
}

// ============================================================================
// Identity
// ============================================================================

/// Checks whether `pid` was started with `--remote-debugging-port=<port>`.
///
/// Pids are recycled, so a stored record may point at an unrelated process.
/// Returns `None` when the command line cannot be read (gone, not
/// permitted, or unsupported platform).
#[cfg(target_os = "linux")]
#[must_use]
pub fn launched_for_port(pid: u32, port: u16) -> Option<bool> {
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if cmdline.is_empty() {
        // Kernel threads and exiting processes.
        return None;
    }
    let flag = format!("--remote-debugging-port={port}");
    Some(
        cmdline
            .split(|byte| *byte == 0)
            .any(|arg| arg == flag.as_bytes()),
    )
}

/// Checks whether `pid` was started with `--remote-debugging-port=<port>`.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn launched_for_port(_pid: u32, _port: u16) -> Option<bool> {
    None
}

// ============================================================================
// Signals
// ============================================================================

/// Asks the process to exit (`SIGTERM`).
///
/// # Errors
///
/// Returns [`Error::Process`] if the signal could not be delivered to an
/// existing process. A process that is already gone is not an error.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Kills the process (`SIGKILL`).
///
/// # Errors
///
/// Same as [`terminate`].
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(target) = to_nix_pid(pid) else {
        return Err(Error::process(format!("invalid pid {pid}")));
    };

    match kill(target, signal) {
        Ok(()) | Err(Errno::ESRCH) => {
            debug!(pid, ?signal, "Signal sent");
            Ok(())
        }
        Err(e) => Err(Error::process(format!("failed to send {signal:?} to {pid}: {e}"))),
    }
}

/// Asks the process to exit (`taskkill`).
///
/// # Errors
///
/// Returns [`Error::Process`] if `taskkill` cannot be run.
#[cfg(windows)]
pub fn terminate(pid: u32) -> Result<()> {
    taskkill(pid, false)
}

/// Kills the process tree (`taskkill /F /T`).
///
/// # Errors
///
/// Returns [`Error::Process`] if `taskkill` cannot be run.
#[cfg(windows)]
pub fn force_kill(pid: u32) -> Result<()> {
    taskkill(pid, true)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> Result<()> {
    let pid_arg = pid.to_string();
    let mut command = std::process::Command::new("taskkill");
    command.args(["/PID", &pid_arg, "/T"]);
    if force {
        command.arg("/F");
    }
    let status = command
        .status()
        .map_err(|e| Error::process(format!("failed to run taskkill: {e}")))?;
    debug!(pid, force, %status, "taskkill finished");
    Ok(())
}

// ============================================================================
// Waiting
// ============================================================================

/// Waits up to `wait` for the process to disappear. Returns `true` if it did.
pub async fn wait_for_exit(pid: u32, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        if !process_alive(pid) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep((deadline - now).min(EXIT_POLL_INTERVAL)).await;
    }
}

/// Terminates, waits up to `grace`, then kills.
///
/// Returns `true` once the process is confirmed gone. Failures are logged,
/// never raised.
pub async fn stop_process(pid: u32, grace: Duration) -> bool {
    if !process_alive(pid) {
        return true;
    }

    if let Err(e) = terminate(pid) {
        debug!(pid, error = %e, "Graceful terminate failed");
    }
    if wait_for_exit(pid, grace).await {
        debug!(pid, "Process exited gracefully");
        return true;
    }

    debug!(pid, grace_ms = grace.as_millis() as u64, "Grace period elapsed, killing");
    if let Err(e) = force_kill(pid) {
        warn!(pid, error = %e, "Forced kill failed");
    }
    let gone = wait_for_exit(pid, KILL_CONFIRM_TIMEOUT).await;
    if !gone {
        warn!(pid, "Process still alive after forced kill");
    }
    gone
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::process::{Command, Stdio};

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep")
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn test_reaped_process_is_dead() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!process_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unreaped_child_counts_as_dead() {
        let mut child = spawn_sleeper();
        let pid = child.id();
        force_kill(pid).expect("kill");
        std::thread::sleep(Duration::from_millis(200));

        // Killed but not yet waited on: a zombie.
        assert!(!process_alive(pid));
        child.wait().expect("reap");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_process_terminates() {
        let mut child = spawn_sleeper();
        let pid = child.id();
        assert!(process_alive(pid));

        assert!(stop_process(pid, Duration::from_secs(2)).await);
        let status = child.wait().expect("reap");
        assert!(!status.success());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_launched_for_port_reads_command_line() {
        let mut flagged = Command::new("sh")
            .args(["-c", "while :; do sleep 0.1; done", "devtools", "--remote-debugging-port=9555"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sh");
        let mut other = spawn_sleeper();

        assert_eq!(launched_for_port(flagged.id(), 9555), Some(true));
        assert_eq!(launched_for_port(flagged.id(), 9556), Some(false));
        assert_eq!(launched_for_port(other.id(), 9555), Some(false));

        for child in [&mut flagged, &mut other] {
            force_kill(child.id()).expect("kill");
            child.wait().expect("reap");
        }
        assert_eq!(launched_for_port(other.id(), 9555), None);
    }

    #[test]
    fn test_signal_to_missing_process_is_ok() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(terminate(pid).is_ok());
    }
}
