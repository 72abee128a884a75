//! Browser launch options.
//!
//! # Example
//!
//! ```ignore
//! use devtools_channel::LaunchOptions;
//!
//! let options = LaunchOptions::new()
//!     .with_port(9333)
//!     .with_headless(false)
//!     .with_arg("--window-size=1280,720");
//! options.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default remote debugging port.
pub const DEFAULT_PORT: u16 = 9222;

/// Default host the endpoint is checked on.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default time allowed for the endpoint to come up.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

/// Default interval between readiness checks.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_millis(100);

/// Default grace period between terminate and kill.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// LaunchOptions
// ============================================================================

/// How the supervised browser is located, started and stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Host the debugging endpoint listens on.
    pub host: String,

    /// Remote debugging port; also the key of the process record.
    pub port: u16,

    /// Explicit executable, skipping discovery.
    pub executable: Option<PathBuf>,

    /// Run without a window.
    pub headless: bool,

    /// Profile directory; a temporary one is generated when `None`.
    pub profile_dir: Option<PathBuf>,

    /// Extra command-line flags, appended after the baseline flags.
    pub extra_args: Vec<String>,

    /// Maximum time to wait for the endpoint after spawning.
    pub startup_timeout: Duration,

    /// Interval between readiness checks.
    pub health_interval: Duration,

    /// Time allowed for a graceful exit before the process is killed.
    pub shutdown_grace: Duration,

    /// Directory holding process records and launch claims.
    pub record_dir: PathBuf,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            executable: None,
            headless: true,
            profile_dir: None,
            extra_args: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            record_dir: default_record_dir(),
        }
    }
}

/// Returns `<temp>/devtools-channel`.
#[must_use]
pub fn default_record_dir() -> PathBuf {
    std::env::temp_dir().join("devtools-channel")
}

// ============================================================================
// Builder Methods
// ============================================================================

impl LaunchOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the debugging port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets an explicit executable.
    #[inline]
    #[must_use]
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Enables or disables headless mode.
    #[inline]
    #[must_use]
    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Uses an existing profile directory.
    #[inline]
    #[must_use]
    pub fn with_profile_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.profile_dir = Some(path.into());
        self
    }

    /// Adds a command-line flag.
    #[inline]
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Adds multiple command-line flags.
    #[inline]
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the startup timeout.
    #[inline]
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Sets the readiness check interval.
    #[inline]
    #[must_use]
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Sets the shutdown grace period.
    #[inline]
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the record directory.
    #[inline]
    #[must_use]
    pub fn with_record_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_dir = dir.into();
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl LaunchOptions {
    /// Checks the options for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("port must be non-zero"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        if self.startup_timeout.is_zero() {
            return Err(Error::config("startup_timeout must be non-zero"));
        }
        if self.health_interval.is_zero() {
            return Err(Error::config("health_interval must be non-zero"));
        }
        if let Some(arg) = self.extra_args.iter().find(|arg| {
            arg.starts_with("--remote-debugging-port") || arg.starts_with("--user-data-dir")
        }) {
            return Err(Error::config(format!(
                "{arg} is managed by the supervisor; use the dedicated option"
            )));
        }
        Ok(())
    }

    /// Base URL of the HTTP discovery endpoint.
    #[must_use]
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Tests
// ============================================================================
