// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use crate::docker::DockerError;
use crate::workspace::WorkspaceState;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(workspace_host::config::error),
        help("Check the host configuration file, or run `workspace-host validate`")
    )]
    Config(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(workspace_host::config::validation),
        help("Run `workspace-host validate` for detailed validation errors")
    )]
    Validation(String),

    #[error("Container engine error: {0}")]
    #[diagnostic(
        code(workspace_host::docker::error),
        help("Check that Docker is running with `docker ps`")
    )]
    Docker(#[from] DockerError),

    #[error("{0}")]
    #[diagnostic(
        code(workspace_host::docker::cleanup),
        help("Remove the leftover container with `docker rm -f <container>`, then retry")
    )]
    Cleanup(String),

    #[error("No free ports available on this host ({attempts} candidate port(s) tried in {min}..{max})")]
    #[diagnostic(
        code(workspace_host::port::exhausted),
        help("Stop idle workspaces or widen `port_range` in the host configuration")
    )]
    PortsExhausted { min: u16, max: u16, attempts: usize },

    #[error("Workspace not found: {0}")]
    #[diagnostic(
        code(workspace_host::workspace::not_found),
        help("List known workspaces with `workspace-host status`")
    )]
    WorkspaceNotFound(String),

    #[error("Invalid workspace id '{id}': {reason}")]
    #[diagnostic(code(workspace_host::workspace::invalid_id))]
    InvalidWorkspaceId { id: String, reason: String },

    #[error("Invalid state transition for workspace '{id}': {from} -> {to}")]
    #[diagnostic(
        code(workspace_host::workspace::invalid_transition),
        help("This indicates a bug in the workspace lifecycle; please report it")
    )]
    InvalidTransition {
        id: String,
        from: WorkspaceState,
        to: WorkspaceState,
    },

    #[error("Workspace '{0}' has no image configured")]
    #[diagnostic(
        code(workspace_host::workspace::no_image),
        help("Set `defaults.image` in the host configuration or send settings with the start request")
    )]
    MissingImage(String),

    #[error("Workspace '{id}' did not become ready: {reason}")]
    #[diagnostic(
        code(workspace_host::workspace::not_ready),
        help("Check the container logs with `docker logs <container>`; increase `readiness.timeout` for slow images")
    )]
    NotReady { id: String, reason: String },

    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("Host is shutting down")]
    #[diagnostic(
        code(workspace_host::host::shutting_down),
        help("Retry the request once the host has restarted")
    )]
    ShuttingDown,

    #[error("Blob store error: {0}")]
    #[diagnostic(code(workspace_host::blob::error))]
    BlobStore(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(workspace_host::filesystem::error))]
    Filesystem(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    #[diagnostic(
        code(workspace_host::database::error),
        help("See recovery suggestions based on the specific error type")
    )]
    Database(#[from] tokio_rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::from(err))
    }
}

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::WorkspaceNotFound(id) => Some(format!(
                "No workspace '{}' is registered on this host. Start it first, or check `workspace-host status`.",
                id
            )),
            Error::PortsExhausted { min, max, .. } => Some(format!(
                "All ports in {}..{} are taken. Stop idle workspaces or widen `port_range`.",
                min, max
            )),
            Error::Docker(DockerError::DaemonUnavailable) => {
                Some("Start the Docker daemon and retry.".to_string())
            }
            Error::Docker(DockerError::ExecFailed { .. }) => {
                Some("Make sure the `docker` binary is installed and on PATH.".to_string())
            }
            Error::Database(e) => {
                let msg = e.to_string();
                if msg.contains("locked") || msg.contains("busy") {
                    Some("Another workspace-host process may be using the same state_dir.".to_string())
                } else if msg.contains("corrupt") || msg.contains("malformed") {
                    Some(
                        "The registry database looks damaged. Move `registry.db` out of state_dir to start fresh; containers will be pruned on the next start."
                            .to_string(),
                    )
                } else {
                    None
                }
            }
            Error::ShuttingDown => Some("Retry once the host is back up.".to_string()),
            _ => None,
        }
    }

    /// True when the error means "all ports are taken" rather than an engine failure.
    pub fn is_port_exhaustion(&self) -> bool {
        matches!(self, Error::PortsExhausted { .. })
    }

    /// Message shown to the user when a launch fails with this error.
    pub fn user_message(&self) -> String {
        match self {
            Error::PortsExhausted { .. } => {
                "No free ports available on this host. Click \"Reboot\" to try again.".to_string()
            }
            Error::Docker(e) => format!("Container engine error: {}", e),
            Error::NotReady { reason, .. } => format!("Workspace did not start: {}", reason),
            Error::MissingImage(_) => "No workspace image is configured.".to_string(),
            Error::Timeout { operation, .. } => format!("Timed out while {}", operation),
            other => other.to_string(),
        }
    }
}
