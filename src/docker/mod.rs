//! Container engine access.
//!
//! The supervisor, pruner and log forwarder talk to containers only through
//! the [`ContainerEngine`] trait. [`DockerClient`] is the production
//! implementation and shells out to the `docker` CLI with a deadline on
//! every call.

pub mod client;
pub mod error;
mod spec;

pub use client::DockerClient;
pub use error::DockerError;
pub use spec::{ContainerSpec, ContainerSummary};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Label present on every container this host creates.
pub const LABEL_MANAGED: &str = "workspace-host.managed";
/// Label carrying the owning workspace id.
pub const LABEL_WORKSPACE_ID: &str = "workspace-host.workspace-id";
/// Label carrying the workspace version the container was launched for.
pub const LABEL_WORKSPACE_VERSION: &str = "workspace-host.workspace-version";

/// The subset of a container engine the host relies on.
///
/// Every method is expected to enforce its own deadline and to report a
/// timeout as [`DockerError::Timeout`] rather than hang.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Fails with [`DockerError::DaemonUnavailable`] if the engine is down.
    async fn ping(&self) -> Result<(), DockerError>;

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError>;

    async fn pull_image(&self, image: &str) -> Result<(), DockerError>;

    /// Create (but don't start) a container. Returns the engine's container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, DockerError>;

    async fn start(&self, container: &str) -> Result<(), DockerError>;

    /// Stop a container, giving it `grace` before it is killed.
    /// A container that is already stopped or gone is not an error.
    async fn stop(&self, container: &str, grace: Duration) -> Result<(), DockerError>;

    /// Force-remove a container. A container that is already gone is not an error.
    async fn remove(&self, container: &str) -> Result<(), DockerError>;

    /// Fetch output (stdout and stderr, interleaved, timestamped) emitted
    /// in `[since, until]`.
    async fn logs_between(
        &self,
        container: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<u8>, DockerError>;

    /// List every container carrying [`LABEL_MANAGED`], running or not.
    async fn list_managed(&self) -> Result<Vec<ContainerSummary>, DockerError>;
}
