//! Error types for the devtools channel.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use devtools_channel::{Error, Result, Session};
//! use serde_json::json;
//!
//! async fn example(session: &Session) -> Result<()> {
//!     match session.send("Page.navigate", json!({ "url": "https://example.com" })).await {
//!         Ok(result) => println!("frame: {}", result["frameId"]),
//!         Err(Error::Remote { code, message, .. }) => eprintln!("remote said {code}: {message}"),
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Kind | Variants |
//! |------|----------|
//! | Protocol | [`Error::Protocol`], [`Error::Handshake`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Timeout | [`Error::Timeout`], [`Error::RequestTimeout`] |
//! | Remote | [`Error::Remote`] |
//! | Process | [`Error::ExecutableNotFound`], [`Error::ProcessLaunchFailed`], [`Error::ProcessExited`], [`Error::StartupTimeout`], [`Error::Process`] |
//! | Config | [`Error::Config`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Http`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::path::PathBuf;
use std::result::Result as StdResult;

use serde_json::Value;
use thiserror::Error;

use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging. Use
/// [`Error::kind`] to branch on the broad category.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when launch or session options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed frame or message, or a protocol rule was violated.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// WebSocket upgrade handshake failed or was invalid.
    #[error("Handshake failed: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Socket refused, reset or failed mid-operation.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed, either by the remote or locally.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Timeout Errors
    // ========================================================================
    /// Operation timeout.
    ///
    /// Returned when a bounded wait (handshake, readiness, event) expires.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Command did not receive its correlated response in time.
    #[error("Request {request_id} ({method}) timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Method of the command.
        method: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Remote Errors
    // ========================================================================
    /// Well-formed error response from the remote end.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Error code reported by the remote.
        code: i64,
        /// Error message reported by the remote.
        message: String,
        /// Optional extra detail.
        data: Option<Value>,
    },

    // ========================================================================
    // Process Errors
    // ========================================================================
    /// No browser executable could be located.
    #[error("Browser executable not found on {platform} (searched: {})", format_paths(.searched))]
    ExecutableNotFound {
        /// Platform that was searched.
        platform: &'static str,
        /// Candidate paths and names that were tried.
        searched: Vec<PathBuf>,
    },

    /// Spawning the browser process failed.
    #[error("Failed to launch browser: {message}")]
    ProcessLaunchFailed {
        /// Description of the launch failure.
        message: String,
    },

    /// Browser process exited before it became healthy.
    #[error("Browser process {pid} exited before becoming ready: {status}")]
    ProcessExited {
        /// Process ID of the exited browser.
        pid: u32,
        /// Exit status description.
        status: String,
    },

    /// Browser did not answer its health endpoint in time.
    #[error("Browser on port {port} not ready after {timeout_ms}ms")]
    StartupTimeout {
        /// Debugging port that was checked.
        port: u16,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Other process supervision failure.
    #[error("Process error: {message}")]
    Process {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error from the discovery endpoint.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// ErrorKind
// ============================================================================

/// Broad error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed frame or failed handshake.
    Protocol,
    /// Socket failure or closed connection.
    Connection,
    /// Deadline exceeded.
    Timeout,
    /// Error response from the remote end.
    Remote,
    /// Browser process could not be found, started or kept alive.
    Process,
    /// Invalid configuration.
    Config,
    /// Serialization, filesystem or HTTP failure.
    Other,
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, method: impl Into<String>, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            method: method.into(),
            timeout_ms,
        }
    }

    /// Creates a remote error.
    #[inline]
    pub fn remote(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
            data,
        }
    }

    /// Creates an executable not found error.
    #[inline]
    pub fn executable_not_found(platform: &'static str, searched: Vec<PathBuf>) -> Self {
        Self::ExecutableNotFound { platform, searched }
    }

    /// Creates a process launch failed error.
    #[inline]
    pub fn process_launch_failed(message: impl Into<String>) -> Self {
        Self::ProcessLaunchFailed {
            message: message.into(),
        }
    }

    /// Creates a process exited error.
    #[inline]
    pub fn process_exited(pid: u32, status: impl Into<String>) -> Self {
        Self::ProcessExited {
            pid,
            status: status.into(),
        }
    }

    /// Creates a startup timeout error.
    #[inline]
    pub fn startup_timeout(port: u16, timeout_ms: u64) -> Self {
        Self::StartupTimeout { port, timeout_ms }
    }

    /// Creates a generic process error.
    #[inline]
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns the broad category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol { .. } | Self::Handshake { .. } => ErrorKind::Protocol,
            Self::Connection { .. } | Self::ConnectionClosed => ErrorKind::Connection,
            Self::Timeout { .. } | Self::RequestTimeout { .. } => ErrorKind::Timeout,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::ExecutableNotFound { .. }
            | Self::ProcessLaunchFailed { .. }
            | Self::ProcessExited { .. }
            | Self::StartupTimeout { .. }
            | Self::Process { .. } => ErrorKind::Process,
            Self::Config { .. } => ErrorKind::Config,
            Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Url(_) => ErrorKind::Other,
        }
    }

    /// Returns `true` if this is a timeout error.
    ///
    /// A startup timeout counts as both a process error and a timeout.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout || matches!(self, Self::StartupTimeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Returns `true` if this is a protocol error.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    /// Returns `true` if this is an error response from the remote end.
    #[inline]
    #[must_use]
    pub fn is_remote_error(&self) -> bool {
        self.kind() == ErrorKind::Remote
    }

    /// Returns `true` if this is a process supervision error.
    #[inline]
    #[must_use]
    pub fn is_process_error(&self) -> bool {
        self.kind() == ErrorKind::Process
    }
}

// ============================================================================
// Tests
// ============================================================================
