//! Browser process lifecycle.
//!
//! # Launch sequence
//!
//! 1. Check the port; a healthy endpoint is reused, nothing is spawned
//! 2. Take the per-port launch claim
//! 3. Locate the executable and detect its version
//! 4. Spawn detached with null stdio, then poll until healthy, racing the
//!    child's exit so a crash is reported immediately
//! 5. Persist the [`ProcessRecord`]

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::supervisor::discovery::{DiscoveryClient, REQUEST_TIMEOUT};
use crate::supervisor::executable::{VERSION_TIMEOUT, detect_version, find_executable, headless_flag};
use crate::supervisor::options::LaunchOptions;
use crate::supervisor::process::{self, process_alive, stop_process};
use crate::supervisor::record::{ProcessRecord, RecordStore};

// ============================================================================
// Constants
// ============================================================================

/// Flags passed to every launch, before the headless and profile flags.
const BASELINE_FLAGS: &[&str] = &[
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--metrics-recording-only",
    "--password-store=basic",
    "--use-mock-keychain",
];

/// Page opened at startup.
const START_URL: &str = "about:blank";

/// Slack added on top of the longest time a launcher holds its claim.
const CLAIM_SLACK: Duration = Duration::from_secs(5);

// ============================================================================
// Types
// ============================================================================

/// Result of [`ProcessSupervisor::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A new process was spawned and is healthy.
    Spawned(ProcessRecord),
    /// The port already answered; the record is present if one was stored.
    Reused(Option<ProcessRecord>),
}

impl LaunchOutcome {
    /// Returns the record, if any.
    #[must_use]
    pub fn record(&self) -> Option<&ProcessRecord> {
        match self {
            Self::Spawned(record) => Some(record),
            Self::Reused(record) => record.as_ref(),
        }
    }

    /// Returns `true` if a process was spawned.
    #[inline]
    #[must_use]
    pub fn spawned(&self) -> bool {
        matches!(self, Self::Spawned(_))
    }
}

/// Snapshot returned by [`ProcessSupervisor::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// Tracked pid, if any.
    pub pid: Option<u32>,
    /// Debugging port.
    pub port: u16,
    /// The tracked pid is running.
    pub alive: bool,
    /// The endpoint answers.
    pub healthy: bool,
}

// ============================================================================
// ChildGuard
// ============================================================================

/// Owns a spawned child and kills it when dropped.
struct ChildGuard {
    child: Option<Child>,
    pid: u32,
}

impl ChildGuard {
    fn new(child: Child, pid: u32) -> Self {
        debug!(pid, "Child guard created");
        Self {
            child: Some(child),
            pid,
        }
    }

    /// Graceful terminate, wait up to `grace`, then kill. Returns `true` once
    /// the child is reaped.
    async fn stop(&mut self, grace: Duration) -> bool {
        let Some(mut child) = self.child.take() else {
            return true;
        };

        if let Err(e) = process::terminate(self.pid) {
            debug!(pid = self.pid, error = %e, "Graceful terminate failed");
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, %status, "Process exited gracefully");
                return true;
            }
            Ok(Err(e)) => debug!(pid = self.pid, error = %e, "Failed to wait for process"),
            Err(_) => debug!(pid = self.pid, "Grace period elapsed, killing"),
        }

        if let Err(e) = child.kill().await {
            warn!(pid = self.pid, error = %e, "Failed to kill process");
            return false;
        }
        true
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            debug!(pid = self.pid, error = %e, "Failed to send kill signal in Drop");
        }
    }
}

/// A process spawned by this supervisor.
struct Running {
    guard: ChildGuard,
    record: ProcessRecord,
    _profile: Option<TempDir>,
}

// ============================================================================
// ProcessSupervisor
// ============================================================================

/// Launches, checks and stops the browser on one port.
pub struct ProcessSupervisor {
    options: LaunchOptions,
    store: RecordStore,
    discovery: DiscoveryClient,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("port", &self.options.port)
            .field("record_dir", &self.store.dir())
            .field("spawned_pid", &self.running.lock().as_ref().map(|r| r.record.pid))
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Creates a supervisor. Nothing is started until [`ProcessSupervisor::launch`].
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options are invalid
    /// - [`Error::Http`] if the discovery client cannot be built
    pub fn new(options: LaunchOptions) -> Result<Self> {
        options.validate()?;
        let discovery = DiscoveryClient::new(&options.host, options.port)?;
        Ok(Self {
            store: RecordStore::new(options.record_dir.clone()),
            discovery,
            options,
            running: Mutex::new(None),
        })
    }

    /// Returns the launch options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Returns the record store.
    #[inline]
    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Returns the discovery client for the supervised port.
    #[inline]
    #[must_use]
    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    /// Returns `true` if this supervisor spawned the current process.
    #[must_use]
    pub fn owns_process(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Locates the executable per the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutableNotFound`].
    pub fn find_executable(&self) -> Result<PathBuf> {
        find_executable(self.options.executable.as_deref())
    }
}

// ============================================================================
// ProcessSupervisor - Launch
// ============================================================================

impl ProcessSupervisor {
    /// Makes the endpoint reachable, spawning the browser only if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::ExecutableNotFound`] if no executable is found
    /// - [`Error::ProcessLaunchFailed`] if spawning fails
    /// - [`Error::ProcessExited`] if the browser dies before becoming healthy
    /// - [`Error::StartupTimeout`] if it never becomes healthy (it is killed)
    /// - [`Error::Process`] if another launcher holds the port's claim
    pub async fn launch(&self) -> Result<LaunchOutcome> {
        let port = self.options.port;

        let existing = self.running.lock().as_ref().map(|r| r.record.clone());
        if let Some(record) = existing
            && self.health_check().await
        {
            debug!(pid = record.pid, port, "Already running");
            return Ok(LaunchOutcome::Reused(Some(record)));
        }

        if self.health_check().await {
            info!(port, "Endpoint already healthy, reusing");
            return Ok(LaunchOutcome::Reused(self.stored_record()));
        }

        let _claim = self.store.claim(port, self.claim_stale_after())?;

        // Another launcher may have finished while we were claiming.
        if self.health_check().await {
            info!(port, "Endpoint became healthy while claiming, reusing");
            return Ok(LaunchOutcome::Reused(self.stored_record()));
        }

        let executable = self.find_executable()?;
        let version = detect_version(&executable).await;

        let (profile_dir, temp_profile) = match &self.options.profile_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("devtools-profile-")
                    .tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        let args = build_args(&self.options, version, &profile_dir);
        let (child, pid) = spawn_detached(&executable, &args)?;
        let mut guard = ChildGuard::new(child, pid);
        info!(pid, port, executable = %executable.display(), ?version, "Browser process spawned");

        if let Err(e) = self.wait_until_ready(&mut guard).await {
            guard.stop(Duration::ZERO).await;
            return Err(e);
        }

        let record = ProcessRecord::new(pid, port, &profile_dir)
            .with_temporary_profile(temp_profile.is_some())
            .with_executable(&executable);
        if let Err(e) = self.store.save(&record) {
            guard.stop(self.options.shutdown_grace).await;
            return Err(e);
        }

        info!(pid, port, "Browser endpoint ready");
        *self.running.lock() = Some(Running {
            guard,
            record: record.clone(),
            _profile: temp_profile,
        });
        Ok(LaunchOutcome::Spawned(record))
    }

    /// Polls until healthy, the child exits, or the startup timeout passes.
    async fn wait_until_ready(&self, guard: &mut ChildGuard) -> Result<()> {
        let pid = guard.pid;
        let deadline = Instant::now() + self.options.startup_timeout;
        let Some(child) = guard.child.as_mut() else {
            return Err(Error::process("child handle missing"));
        };

        loop {
            if self.health_check().await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(pid, port = self.options.port, "Startup timeout, killing process");
                return Err(Error::startup_timeout(
                    self.options.port,
                    self.options.startup_timeout.as_millis() as u64,
                ));
            }

            let exited = tokio::select! {
                status = child.wait() => Some(status),
                () = sleep((deadline - now).min(self.options.health_interval)) => None,
            };

            if let Some(status) = exited {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("wait failed: {e}"),
                };
                warn!(pid, %status, "Browser exited during startup");
                guard.child = None;
                return Err(Error::process_exited(pid, status));
            }
        }
    }

    /// Age after which another launcher's claim counts as abandoned.
    ///
    /// Covers every step a launcher performs while holding the claim: the
    /// re-check, the version query, startup, and stopping a failed child.
    fn claim_stale_after(&self) -> Duration {
        REQUEST_TIMEOUT
            + VERSION_TIMEOUT
            + self.options.startup_timeout
            + REQUEST_TIMEOUT
            + self.options.shutdown_grace
            + process::KILL_CONFIRM_TIMEOUT
            + CLAIM_SLACK
    }

    fn stored_record(&self) -> Option<ProcessRecord> {
        match self.store.load(self.options.port) {
            Ok(record) => record,
            Err(e) => {
                debug!(port = self.options.port, error = %e, "Unreadable process record");
                None
            }
        }
    }
}

/// The record's pid now runs something that was not launched for its port.
fn pid_reused(record: &ProcessRecord) -> bool {
    process::launched_for_port(record.pid, record.port) == Some(false)
}

/// Builds the browser command line.
///
/// Order: debugging port, baseline flags, headless flag, profile flag,
/// caller flags, start URL.
#[must_use]
pub fn build_args(options: &LaunchOptions, major_version: Option<u32>, profile_dir: &Path) -> Vec<String> {
    let mut args = Vec::with_capacity(BASELINE_FLAGS.len() + options.extra_args.len() + 4);
    args.push(format!("--remote-debugging-port={}", options.port));
    args.extend(BASELINE_FLAGS.iter().map(|flag| (*flag).to_string()));
    if options.headless {
        args.push(headless_flag(major_version).to_string());
    }
    args.push(format!("--user-data-dir={}", profile_dir.display()));
    args.extend(options.extra_args.iter().cloned());
    args.push(START_URL.to_string());
    args
}

fn spawn_detached(executable: &Path, args: &[String]) -> Result<(Child, u32)> {
    let mut command = Command::new(executable);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    command.process_group(0);

    #[cfg(windows)]
    {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    let child = command.spawn().map_err(|e| {
        Error::process_launch_failed(format!("{}: {e}", executable.display()))
    })?;
    let pid = child
        .id()
        .ok_or_else(|| Error::process_launch_failed("spawned process has no pid"))?;
    Ok((child, pid))
}

// ============================================================================
// ProcessSupervisor - Health and Shutdown
// ============================================================================

impl ProcessSupervisor {
    /// Read-only reachability check of the endpoint.
    pub async fn health_check(&self) -> bool {
        self.discovery.is_healthy().await
    }

    /// Stops the browser on this port. Idempotent.
    ///
    /// Acts on the process this supervisor spawned, or else on the stored
    /// record for the port. A process that cannot be confirmed dead is
    /// logged and its record kept for [`ProcessSupervisor::cleanup_zombies`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the record cannot be removed.
    pub async fn shutdown(&self) -> Result<()> {
        let port = self.options.port;
        let running = self.running.lock().take();

        if let Some(mut running) = running {
            let pid = running.record.pid;
            info!(pid, port, "Shutting down browser");
            if !running.guard.stop(self.options.shutdown_grace).await {
                warn!(pid, port, "Could not confirm browser exit");
                return Ok(());
            }
            self.store.remove(port)?;
            // Dropping `running` removes a generated profile.
            info!(pid, port, "Browser stopped");
            return Ok(());
        }

        let Some(record) = self.stored_record() else {
            debug!(port, "Nothing to shut down");
            return Ok(());
        };

        if pid_reused(&record) {
            warn!(pid = record.pid, port, "Recorded pid belongs to another process, dropping record");
            self.store.remove(port)?;
            record.remove_temporary_profile();
            return Ok(());
        }

        info!(pid = record.pid, port, "Shutting down recorded browser");
        if !stop_process(record.pid, self.options.shutdown_grace).await {
            warn!(pid = record.pid, port, "Could not confirm browser exit");
            return Ok(());
        }
        self.store.remove(port)?;
        record.remove_temporary_profile();
        info!(pid = record.pid, port, "Browser stopped");
        Ok(())
    }

    /// Reclaims stale records.
    ///
    /// Dead pid, or a pid since reused by an unrelated process: record
    /// removed. Alive but not answering on its port: killed, then record
    /// removed. Healthy, or still being launched: left alone. Safe to run
    /// repeatedly. Returns the reclaimed records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the record directory cannot be read.
    pub async fn cleanup_zombies(&self) -> Result<Vec<ProcessRecord>> {
        let mut reclaimed = Vec::new();

        for record in self.store.list()? {
            if self.store.is_claimed(record.port, self.claim_stale_after()) {
                debug!(port = record.port, "Launch in progress, skipping");
                continue;
            }

            if process_alive(record.pid) {
                let endpoint = DiscoveryClient::new(&self.options.host, record.port)?;
                if endpoint.is_healthy().await {
                    continue;
                }
                if pid_reused(&record) {
                    debug!(pid = record.pid, port = record.port, "Recorded pid reused by another process");
                    self.discard(&record, &mut reclaimed);
                    continue;
                }
                warn!(pid = record.pid, port = record.port, "Unresponsive browser, killing");
                if let Err(e) = process::force_kill(record.pid) {
                    warn!(pid = record.pid, error = %e, "Forced kill failed");
                    continue;
                }
                process::wait_for_exit(record.pid, process::KILL_CONFIRM_TIMEOUT).await;
            } else {
                debug!(pid = record.pid, port = record.port, "Removing record of dead process");
            }

            self.discard(&record, &mut reclaimed);
        }

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed stale browser records");
        }
        Ok(reclaimed)
    }

    fn discard(&self, record: &ProcessRecord, reclaimed: &mut Vec<ProcessRecord>) {
        if let Err(e) = self.store.remove(record.port) {
            warn!(port = record.port, error = %e, "Failed to remove stale record");
            return;
        }
        record.remove_temporary_profile();
        reclaimed.push(record.clone());
    }

    /// Returns pid, liveness and health for this port.
    pub async fn status(&self) -> SupervisorStatus {
        let pid = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.record.pid)
            .or_else(|| self.stored_record().map(|record| record.pid));

        SupervisorStatus {
            pid,
            port: self.options.port,
            alive: pid.is_some_and(process_alive),
            healthy: self.health_check().await,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
