//! Session layer: command correlation and event delivery.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `bus` | [`EventBus`] subscriptions, dispatch, queueing and waiters |
//! | `core` | [`Session`] pending-request table and read loop |

// ============================================================================
// Submodules
// ============================================================================

/// Named-event subscriptions.
pub mod bus;

/// Command/response correlation.
pub mod core;

// ============================================================================
// Re-exports
// ============================================================================

pub use bus::{BoxError, EventBus, EventHandler, EventWaiter, HandlerResult};
pub use self::core::{ResponseCallback, Session, SessionConfig};
