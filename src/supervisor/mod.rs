//! Browser process supervision.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ProcessSupervisor`] | Launch, health check, shutdown, zombie reclamation |
//! | [`LaunchOptions`] | Executable, port, profile and timing options |
//! | [`RecordStore`] | Per-port process records and launch claims |
//! | [`DiscoveryClient`] | `/json/version` and `/json/list` client |
//!
//! # Example
//!
//! ```ignore
//! use devtools_channel::{LaunchOptions, ProcessSupervisor};
//!
//! let supervisor = ProcessSupervisor::new(LaunchOptions::new().with_port(9333))?;
//! supervisor.cleanup_zombies().await?;
//! let outcome = supervisor.launch().await?;
//! let ws_url = supervisor.discovery().page_ws_url().await?;
//! // ...
//! supervisor.shutdown().await?;
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Supervisor implementation.
pub mod core;

/// Discovery endpoint client.
pub mod discovery;

/// Executable lookup and version detection.
pub mod executable;

/// Launch options.
pub mod options;

/// Pid-addressed process helpers.
pub mod process;

/// Process records and launch claims.
pub mod record;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::{LaunchOutcome, ProcessSupervisor, SupervisorStatus, build_args};
pub use discovery::{DiscoveryClient, TargetInfo, VersionInfo};
pub use executable::{find_executable, headless_flag, parse_major_version};
pub use options::LaunchOptions;
pub use record::{LaunchClaim, ProcessRecord, RecordStore};
