use crate::config::{ResourceLimits, WorkspaceDefaults};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle state of a workspace.
///
/// # State Transitions
///
/// ```text
/// Uninitialized ──► Launching ──► Running ──► Stopping ──► Stopped
///                      │             │           │            │
///                      ▼             ▼           ▼            │
///                   Errored ◄────────┴───────────┘            │
///                      │                                      │
///                      └──────────► Launching ◄───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    /// Registered, never launched
    Uninitialized,
    /// Container is being prepared
    Launching,
    /// Container answered the readiness probe
    Running,
    /// Container is being torn down
    Stopping,
    /// No container; can be relaunched
    Stopped,
    /// Launch or supervision failed; can be relaunched
    Errored,
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uninitialized" => Ok(WorkspaceState::Uninitialized),
            "launching" => Ok(WorkspaceState::Launching),
            "running" => Ok(WorkspaceState::Running),
            "stopping" => Ok(WorkspaceState::Stopping),
            "stopped" => Ok(WorkspaceState::Stopped),
            "errored" => Ok(WorkspaceState::Errored),
            other => Err(Error::Protocol(format!("unknown workspace state '{}'", other))),
        }
    }
}

impl WorkspaceState {
    pub const ALL: [WorkspaceState; 6] = [
        WorkspaceState::Uninitialized,
        WorkspaceState::Launching,
        WorkspaceState::Running,
        WorkspaceState::Stopping,
        WorkspaceState::Stopped,
        WorkspaceState::Errored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Uninitialized => "uninitialized",
            WorkspaceState::Launching => "launching",
            WorkspaceState::Running => "running",
            WorkspaceState::Stopping => "stopping",
            WorkspaceState::Stopped => "stopped",
            WorkspaceState::Errored => "errored",
        }
    }

    /// States in which a container (and its port) may exist.
    pub fn has_container(&self) -> bool {
        matches!(
            self,
            WorkspaceState::Launching | WorkspaceState::Running | WorkspaceState::Stopping
        )
    }

    /// States from which `launch` starts a new version.
    pub fn can_launch(&self) -> bool {
        matches!(
            self,
            WorkspaceState::Uninitialized | WorkspaceState::Stopped | WorkspaceState::Errored
        )
    }

    /// Check if a state transition is valid according to the state machine.
    ///
    /// # Examples
    ///
    /// ```
    /// use workspace_host::workspace::WorkspaceState;
    ///
    /// assert!(WorkspaceState::Uninitialized.is_valid_transition(WorkspaceState::Launching));
    /// assert!(WorkspaceState::Launching.is_valid_transition(WorkspaceState::Running));
    /// assert!(!WorkspaceState::Stopped.is_valid_transition(WorkspaceState::Running)); // Must relaunch
    /// ```
    pub fn is_valid_transition(&self, to: WorkspaceState) -> bool {
        use WorkspaceState::*;
        match (self, to) {
            // Same state is always valid (message-only update)
            (s1, s2) if *s1 == s2 => true,

            (Uninitialized | Stopped | Errored, Launching) => true,

            (Launching, Running) => true,
            (Launching, Errored) => true,
            // Launch timeout or an explicit stop during launch
            (Launching, Stopping) => true,

            (Running, Stopping) => true,
            (Running, Errored) => true,

            (Stopping, Stopped) => true,
            (Stopping, Errored) => true,

            // Cleaning up a failed workspace
            (Errored, Stopping) => true,
            (Errored, Stopped) => true,

            _ => false,
        }
    }
}

/// Container settings stored per workspace; unset fields fall back to the
/// host's [`WorkspaceDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Settings after defaults have been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub image: String,
    pub port: u16,
    pub home: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl WorkspaceSettings {
    pub fn resolve(&self, workspace_id: &str, defaults: &WorkspaceDefaults) -> Result<ResolvedSettings> {
        let image = self
            .image
            .clone()
            .or_else(|| defaults.image.clone())
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| Error::MissingImage(workspace_id.to_string()))?;

        // Workspace env overrides host env key by key
        let mut env = defaults.env.clone();
        env.extend(self.env.clone());

        Ok(ResolvedSettings {
            image,
            port: self.port.unwrap_or(defaults.port),
            home: self.home.clone().unwrap_or_else(|| defaults.home.clone()),
            args: self.args.clone().unwrap_or_else(|| defaults.args.clone()),
            env,
        })
    }
}

/// One row of the workspace registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub state: WorkspaceState,
    pub message: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub state_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_dir_path: Option<PathBuf>,
    #[serde(default)]
    pub settings: WorkspaceSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_flushed_at: Option<DateTime<Utc>>,
    /// Size of the home directory, measured after the last container was removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_usage_bytes: Option<u64>,
}

impl Workspace {
    /// A freshly registered workspace.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: WorkspaceState::Uninitialized,
            message: String::new(),
            version: 0,
            container_ref: None,
            assigned_port: None,
            launched_at: None,
            last_heartbeat_at: None,
            state_updated_at: Utc::now(),
            resource_limits: None,
            home_dir_path: None,
            settings: WorkspaceSettings::default(),
            logs_flushed_at: None,
            disk_usage_bytes: None,
        }
    }

    /// Start of the next log window for the current container.
    pub fn log_watermark(&self) -> Option<DateTime<Utc>> {
        self.logs_flushed_at.or(self.launched_at)
    }
}

/// Validate a workspace id: non-empty, at most 128 bytes, and made only of
/// characters that are safe in container names, paths and blob keys.
pub fn validate_workspace_id(id: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidWorkspaceId {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id.len() > 128 {
        return Err(invalid("must be at most 128 characters"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(invalid("may only contain ASCII letters, digits, '-', '_' and '.'"));
    }
    if id.starts_with('.') || id.starts_with('-') {
        return Err(invalid("must start with a letter, digit or '_'"));
    }
    Ok(())
}

/// A state change together with the metadata that must be written with it.
///
/// Bundling the metadata keeps the registry from ever showing, for example,
/// `running` without a container or `stopped` with a port still assigned.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub state: WorkspaceState,
    pub message: String,
    pub container_ref: Option<String>,
    pub assigned_port: Option<u16>,
    /// Clear `container_ref`, `assigned_port` and `last_heartbeat_at`.
    pub clear_container: bool,
    /// Progress within the current state; rejected if the state has moved on.
    pub message_only: bool,
}

impl StateTransition {
    fn to(state: WorkspaceState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            container_ref: None,
            assigned_port: None,
            clear_container: false,
            message_only: false,
        }
    }

    pub fn running(message: impl Into<String>) -> Self {
        Self::to(WorkspaceState::Running, message)
    }

    pub fn stopping(message: impl Into<String>) -> Self {
        Self::to(WorkspaceState::Stopping, message)
    }

    /// Transition to Stopped (clears container, port and heartbeat)
    pub fn stopped(message: impl Into<String>) -> Self {
        Self {
            clear_container: true,
            ..Self::to(WorkspaceState::Stopped, message)
        }
    }

    /// Transition to Errored (clears container, port and heartbeat)
    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            clear_container: true,
            ..Self::to(WorkspaceState::Errored, message)
        }
    }

    /// Keep the current state, only change the message.
    pub fn message_only(state: WorkspaceState, message: impl Into<String>) -> Self {
        Self {
            message_only: true,
            ..Self::to(state, message)
        }
    }

    pub fn with_container(mut self, container_ref: impl Into<String>) -> Self {
        self.container_ref = Some(container_ref.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.assigned_port = Some(port);
        self
    }

    /// Validate the transition against the current state.
    pub fn validate(&self, id: &str, current: WorkspaceState) -> Result<()> {
        let allowed = if self.message_only {
            current == self.state
        } else {
            current.is_valid_transition(self.state)
        };
        if !allowed {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: self.state,
            });
        }
        if self.clear_container && (self.container_ref.is_some() || self.assigned_port.is_some()) {
            return Err(Error::Protocol(
                "a transition cannot both set and clear the container".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a workspace is being stopped; determines the final message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    HeartbeatTimeout,
    LaunchTimeout,
    Reset,
}

impl StopReason {
    pub fn stopping_message(&self) -> &'static str {
        match self {
            StopReason::Requested => "Stopping workspace",
            StopReason::HeartbeatTimeout => "Stopping idle workspace",
            StopReason::LaunchTimeout => "Workspace took too long to start",
            StopReason::Reset => "Resetting workspace",
        }
    }

    pub fn stopped_message(&self) -> &'static str {
        match self {
            StopReason::Requested => "Workspace stopped",
            StopReason::HeartbeatTimeout => "Workspace stopped after a period of inactivity",
            StopReason::LaunchTimeout => "Workspace took too long to start. Click \"Reboot\" to try again.",
            StopReason::Reset => "Workspace reset",
        }
    }

    /// Where a stop for this reason ends. A launch that timed out is a
    /// failure; every other stop is a clean `stopped`.
    pub fn final_transition(&self) -> StateTransition {
        match self {
            StopReason::LaunchTimeout => StateTransition::errored(self.stopped_message()),
            _ => StateTransition::stopped(self.stopped_message()),
        }
    }
}
