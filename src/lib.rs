//! DevTools Channel - client-side remote debugging over WebSocket.
//!
//! This library talks to a browser's remote-debugging endpoint: it launches
//! or reuses the browser process, discovers the page WebSocket, and runs a
//! command/event session over a from-scratch RFC 6455 client.
//!
//! # Architecture
//!
//! The channel is layered bottom-up:
//!
//! - **Transport**: [`FrameCodec`] + [`Handshake`] + [`Connection`]
//! - **Session**: request/response correlation and the [`EventBus`]
//! - **Supervisor**: process launch, health checks, zombie reclamation
//! - **Browser**: glue that turns a launch into a connected [`Session`]
//!
//! Key design principles:
//!
//! - No background reader task; whichever caller is waiting drives the socket
//! - Every outstanding request fails as soon as the connection is lost
//! - Handler failures are logged and never reach the dispatching caller
//! - One browser per port, guarded by a claim file across processes
//!
//! # Quick Start
//!
//! ```no_run
//! use devtools_channel::{Browser, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let browser = Browser::builder().port(9333).headless(true).launch().await?;
//!     let session = browser.session();
//!
//!     session.on("Page.loadEventFired", |params| {
//!         println!("loaded at {}", params["timestamp"]);
//!         Ok(())
//!     });
//!     session.enable("Page").await?;
//!     session.send("Page.navigate", json!({ "url": "https://example.com" })).await?;
//!
//!     browser.close().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`browser`] | Launch-and-connect orchestration: [`Browser`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Request, response and event message types |
//! | [`session`] | Command correlation and event dispatch |
//! | [`supervisor`] | Browser process lifecycle |
//! | [`transport`] | WebSocket client |

// ============================================================================
// Modules
// ============================================================================

/// Launch-and-connect orchestration.
pub mod browser;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Command/event message types.
pub mod protocol;

/// Command/response session and event bus.
pub mod session;

/// Browser process supervision.
pub mod supervisor;

/// WebSocket transport layer.
pub mod transport;

#[cfg(test)]
mod test_support;

// ============================================================================
// Re-exports
// ============================================================================

// Browser types
pub use browser::{Browser, BrowserBuilder};

// Error types
pub use error::{Error, ErrorKind, Result};

// Identifier types
pub use identifiers::{RequestId, SubscriptionId};

// Protocol types
pub use protocol::{Event, Incoming, RemoteFailure, Request, Response};

// Session types
pub use session::{BoxError, EventBus, EventWaiter, HandlerResult, Session, SessionConfig};

// Supervisor types
pub use supervisor::{
    DiscoveryClient, LaunchOptions, LaunchOutcome, ProcessRecord, ProcessSupervisor,
    RecordStore, SupervisorStatus, TargetInfo, VersionInfo,
};

// Transport types
pub use transport::{Connection, ConnectionState, Frame, FrameCodec, Handshake, Message, OpCode};
