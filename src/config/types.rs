use super::duration::serde_duration;
use super::resources::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Host configuration, loaded once at startup and shared read-only by every
/// component.
///
/// Every field has a default, so an empty file is a valid configuration
/// (apart from `defaults.image`, which must then be supplied per workspace).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Directory holding the registry database and the advisory lock.
    pub state_dir: PathBuf,

    /// Parent of the per-workspace home directories. Defaults to `{state_dir}/workspaces`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces_root: Option<PathBuf>,

    pub port_range: PortRange,

    /// Candidate ports probed per allocation. `0` probes every free slot.
    pub max_port_attempts: usize,

    #[serde(with = "serde_duration")]
    pub heartbeat_interval: Duration,

    /// A running workspace with no heartbeat for this long is stopped.
    #[serde(with = "serde_duration")]
    pub heartbeat_timeout: Duration,

    /// A workspace stuck in `launching` for this long is torn down and marked errored.
    #[serde(with = "serde_duration")]
    pub launch_timeout: Duration,

    #[serde(with = "serde_duration")]
    pub prune_interval: Duration,

    #[serde(with = "serde_duration")]
    pub logs_flush_interval: Duration,

    /// Deadline for individual engine calls other than image pulls.
    #[serde(with = "serde_duration")]
    pub engine_timeout: Duration,

    #[serde(with = "serde_duration")]
    pub pull_timeout: Duration,

    #[serde(with = "serde_duration")]
    pub blob_timeout: Duration,

    /// Time a container gets to exit after SIGTERM before it is killed.
    #[serde(with = "serde_duration")]
    pub stop_grace: Duration,

    /// Minimum spacing between persisted progress messages for one workspace.
    #[serde(with = "serde_duration")]
    pub message_rate_limit: Duration,

    pub readiness: ReadinessConfig,

    pub limits: ResourceLimits,

    /// Owner of the workspace home directories, and the user containers run as.
    pub owner_uid: u32,
    pub owner_gid: u32,

    pub defaults: WorkspaceDefaults,

    pub blob_store: BlobStoreConfig,

    /// Prefix of the `WORKSPACE_BASE_URL` passed to containers.
    pub base_url_prefix: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        let state_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("workspace-host");
        Self {
            state_dir,
            workspaces_root: None,
            port_range: PortRange::default(),
            max_port_attempts: 0,
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(600),
            launch_timeout: Duration::from_secs(1800),
            prune_interval: Duration::from_secs(60),
            logs_flush_interval: Duration::from_secs(60),
            engine_timeout: Duration::from_secs(120),
            pull_timeout: Duration::from_secs(900),
            blob_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            message_rate_limit: Duration::from_secs(1),
            readiness: ReadinessConfig::default(),
            limits: ResourceLimits::default(),
            owner_uid: 0,
            owner_gid: 0,
            defaults: WorkspaceDefaults::default(),
            blob_store: BlobStoreConfig::default(),
            base_url_prefix: "/pl/workspace".to_string(),
        }
    }
}

impl HostConfig {
    pub fn workspaces_root(&self) -> PathBuf {
        self.workspaces_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("workspaces"))
    }

    /// Host directory bind-mounted as the home of workspace `id`.
    pub fn home_dir_for(&self, id: &str) -> PathBuf {
        self.workspaces_root().join(id)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("registry.db")
    }

    pub fn base_url_for(&self, id: &str) -> String {
        format!("{}/{}/container/", self.base_url_prefix.trim_end_matches('/'), id)
    }

    /// Configuration rooted in `dir`, with intervals short enough for tests.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            state_dir: dir.to_path_buf(),
            heartbeat_interval: Duration::from_millis(50),
            prune_interval: Duration::from_millis(200),
            logs_flush_interval: Duration::from_millis(100),
            engine_timeout: Duration::from_secs(5),
            pull_timeout: Duration::from_secs(5),
            blob_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(1),
            message_rate_limit: Duration::ZERO,
            readiness: ReadinessConfig {
                interval: Duration::from_millis(10),
                timeout: Duration::from_secs(2),
                probe_timeout: Duration::from_millis(200),
            },
            defaults: WorkspaceDefaults {
                image: Some("workspace/test:latest".to_string()),
                ..WorkspaceDefaults::default()
            },
            blob_store: BlobStoreConfig::Filesystem {
                path: Some(dir.join("logs")),
            },
            ..Self::default()
        }
    }
}

/// Half-open host port range `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 1024,
            max: 45000,
        }
    }
}

impl PortRange {
    pub fn len(&self) -> usize {
        usize::from(self.max.saturating_sub(self.min))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port < self.max
    }
}

/// How the supervisor decides a freshly started container is ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    /// Pause between probes.
    #[serde(with = "serde_duration")]
    pub interval: Duration,

    /// Total time allowed for the container to answer.
    #[serde(with = "serde_duration")]
    pub timeout: Duration,

    /// Deadline of a single probe request.
    #[serde(with = "serde_duration")]
    pub probe_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Container settings used when a workspace doesn't carry its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Port the workspace service listens on inside the container.
    pub port: u16,

    /// Mount point of the home directory inside the container.
    pub home: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Default for WorkspaceDefaults {
    fn default() -> Self {
        Self {
            image: None,
            port: 8080,
            home: "/home/workspace".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Destination of archived container logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum BlobStoreConfig {
    /// Objects are files under `path` (defaults to `{state_dir}/logs`).
    Filesystem {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    /// Objects are `PUT` to `{url}/{key}`.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
    },
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        BlobStoreConfig::Filesystem { path: None }
    }
}
