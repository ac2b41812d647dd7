//! # Workspace Host
//!
//! Runs per-user workspace containers on a single Docker host and keeps a
//! durable registry of their lifecycle.
//!
//! ## Features
//!
//! - **Lifecycle supervision**: launch, stop and reset workspaces through
//!   `uninitialized → launching → running → stopping → stopped`, with every
//!   write guarded by a per-launch `version`
//! - **Port allocation**: unique host ports from a configured range, checked
//!   against the OS before use
//! - **Heartbeats**: idle workspaces are stopped after a timeout
//! - **Log archiving**: container logs are uploaded to a blob store in
//!   gap-free windows, and once more at teardown
//! - **Crash recovery**: the pruner reconciles the registry with the
//!   containers that actually exist, at startup and periodically
//! - **State events**: subscribers get a snapshot followed by live
//!   `change:state` and `change:message` events
//!
//! ## Quick Start
//!
//! ```no_run
//! use workspace_host::{Parser, WorkspaceHost};
//!
//! # async fn example() -> Result<(), workspace_host::Error> {
//! let config = Parser::new().load_config("workspace-host.yaml")?;
//! let host = WorkspaceHost::open(config).await?;
//! host.start().await?;
//!
//! let result = host.start_workspace("ws-42").await?;
//! if let Some(url) = &result.base_url {
//!     println!("workspace is up at {}", url);
//! }
//!
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Operations on one workspace are serialized by a per-workspace mutex
//! - Launch and stop hold the operation gate shared; the pruner and
//!   shutdown hold it exclusively
//! - Locks are taken in a fixed order, checked in debug builds by
//!   [`lock_order`]

pub mod config;
pub mod control;
pub mod docker;
pub mod error;
pub mod heartbeat;
pub mod host;
pub mod lock_order;
pub mod logs;
pub mod port;
pub mod publisher;
pub mod pruner;
pub mod registry;
pub mod supervisor;
pub mod workspace;

// Re-export commonly used types
pub use config::{HostConfig, Parser};
pub use error::{Error, Result};
pub use host::{HostComponents, WorkspaceHost};
pub use publisher::{Subscription, WorkspaceEvent};
pub use supervisor::LaunchResult;
pub use workspace::{Workspace, WorkspaceState};
