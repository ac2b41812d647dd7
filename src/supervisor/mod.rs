//! Container lifecycle for workspaces.
//!
//! The [`Supervisor`] owns every transition that touches a container:
//!
//! - `launch`: allocate a port, pull the image, create and start the
//!   container, wait until it answers, `running`
//! - `stop`: final log flush, remove the container, release the port,
//!   `stopped`
//! - `reset`: `stop` then `launch` under one hold of the workspace lock
//!
//! # Architecture
//!
//! Operations on one workspace are serialized by a per-workspace async mutex
//! ([`WorkspaceLocks`]); different workspaces proceed in parallel. All of
//! them hold the host-wide [`OperationGate`] shared, so the pruner and
//! shutdown can wait for a quiet host by taking it exclusively.

mod core;
mod locks;
mod readiness;

pub use self::core::{LaunchResult, Supervisor};
pub use locks::{OperationGate, WorkspaceLocks};
pub use readiness::{HttpProbe, ReadinessProbe};
