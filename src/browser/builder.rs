//! Builder pattern for browser configuration.
//!
//! Provides a fluent API over [`LaunchOptions`] and [`SessionConfig`].
//!
//! # Example
//!
//! ```ignore
//! use devtools_channel::Browser;
//!
//! let browser = Browser::builder()
//!     .port(9333)
//!     .headless(true)
//!     .arg("--window-size=1280,720")
//!     .launch()
//!     .await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::session::SessionConfig;
use crate::supervisor::LaunchOptions;

use super::core::Browser;

// ============================================================================
// BrowserBuilder
// ============================================================================

/// Builder for a [`Browser`].
///
/// Use [`Browser::builder()`] to create a new builder.
#[derive(Debug, Clone)]
pub struct BrowserBuilder {
    options: LaunchOptions,
    config: SessionConfig,
    reclaim_zombies: bool,
}

impl Default for BrowserBuilder {
    fn default() -> Self {
        Self {
            options: LaunchOptions::default(),
            config: SessionConfig::default(),
            reclaim_zombies: true,
        }
    }
}

// ============================================================================
// BrowserBuilder - Launch Options
// ============================================================================

impl BrowserBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all launch options.
    #[inline]
    #[must_use]
    pub fn launch_options(mut self, options: LaunchOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the host of the debugging endpoint.
    #[inline]
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.options.host = host.into();
        self
    }

    /// Sets the debugging port.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Sets the browser executable, skipping discovery.
    #[inline]
    #[must_use]
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.executable = Some(path.into());
        self
    }

    /// Enables or disables headless mode.
    #[inline]
    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.options.headless = headless;
        self
    }

    /// Uses an existing profile directory.
    #[inline]
    #[must_use]
    pub fn profile_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.profile_dir = Some(path.into());
        self
    }

    /// Adds a command-line flag.
    #[inline]
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.options.extra_args.push(arg.into());
        self
    }

    /// Adds multiple command-line flags.
    #[inline]
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the startup timeout.
    #[inline]
    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.options.startup_timeout = timeout;
        self
    }

    /// Sets how long shutdown waits before force-killing.
    #[inline]
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.options.shutdown_grace = grace;
        self
    }

    /// Sets the directory for process records.
    #[inline]
    #[must_use]
    pub fn record_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.record_dir = dir.into();
        self
    }

    /// Sweeps stale records before launching (default `true`).
    #[inline]
    #[must_use]
    pub fn reclaim_zombies(mut self, enabled: bool) -> Self {
        self.reclaim_zombies = enabled;
        self
    }
}

// ============================================================================
// BrowserBuilder - Session Options
// ============================================================================

impl BrowserBuilder {
    /// Replaces the session configuration.
    #[inline]
    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the connect timeout.
    #[inline]
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the default command timeout.
    #[inline]
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Caps the number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn max_pending(mut self, max: usize) -> Self {
        self.config.max_pending = max;
        self
    }

    /// Queues events nobody listens to, for later replay.
    #[inline]
    #[must_use]
    pub fn buffer_unhandled_events(mut self, enabled: bool) -> Self {
        self.config.buffer_unhandled_events = enabled;
        self
    }

    /// Launches the browser and connects.
    ///
    /// # Errors
    ///
    /// See [`Browser::launch`].
    pub async fn launch(self) -> Result<Browser> {
        Browser::launch_with(self.options, self.config, self.reclaim_zombies).await
    }
}

// ============================================================================
// Tests
// ============================================================================
