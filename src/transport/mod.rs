//! WebSocket transport layer.
//!
//! A from-scratch client for the remote debugging WebSocket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                              ┌──────────────────┐
//! │  Session (Rust)  │                              │  Browser         │
//! │                  │         WebSocket            │  (remote end)    │
//! │  Connection      │─────────────────────────────►│                  │
//! │  → Handshake     │      host:PORT/path          │  DevTools        │
//! │  → FrameCodec    │◄─────────────────────────────│  server          │
//! └──────────────────┘                              └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Connection::new` / `Connection::from_url` - Disconnected
//! 2. `Connection::connect` - TCP connect + upgrade handshake
//! 3. `Connection::send` / `recv` - text messages, control frames answered
//! 4. `Connection::close` - close exchange
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Frame encoding/decoding with reassembly buffer |
//! | `handshake` | HTTP Upgrade exchange and accept-key check |
//! | `connection` | Socket ownership, control frames, state machine |

// ============================================================================
// Submodules
// ============================================================================

/// Client WebSocket connection.
pub mod connection;

/// WebSocket frame codec.
pub mod frame;

/// HTTP Upgrade handshake.
pub mod handshake;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, ConnectionState, Message};
pub use frame::{Frame, FrameCodec, OpCode, is_control};
pub use handshake::{Handshake, accept_key};
