//! Browser orchestration: launch, discover, connect.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Browser`] | Supervisor plus connected session |
//! | [`BrowserBuilder`] | Fluent configuration builder |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder.
pub mod builder;

/// Browser implementation.
pub mod core;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::Browser;
pub use builder::BrowserBuilder;
