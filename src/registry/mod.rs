//! Durable workspace registry.
//!
//! The registry records, for every workspace this host has ever seen:
//!
//! - Lifecycle state, status message and launch `version`
//! - The current container and host port
//! - Launch snapshot (resource limits, home directory)
//! - Heartbeat and log-forwarding watermarks
//! - Home directory size after the last teardown
//!
//! # Architecture
//!
//! State lives in a SQLite database (`{state_dir}/registry.db`) with WAL mode
//! enabled, so that after a crash the pruner can compare it against the
//! containers that actually exist. Every write is version-guarded: a caller
//! passes the `version` it read, and a write from an older launch is
//! reported as [`TransitionOutcome::Stale`] instead of being applied.
//!
//! # Example
//!
//! ```ignore
//! use workspace_host::registry::WorkspaceRegistry;
//!
//! let registry = WorkspaceRegistry::open(&config.state_dir).await?;
//! let ws = registry.ensure("ws-42").await?;
//! registry.record_heartbeat("ws-42", chrono::Utc::now()).await?;
//! ```

mod sqlite;
mod types;

pub use sqlite::SqliteRegistry;
pub use types::{HistoryEntry, LaunchRecord, TransitionOutcome};

/// Primary registry type, backed by SQLite.
pub type WorkspaceRegistry = SqliteRegistry;
