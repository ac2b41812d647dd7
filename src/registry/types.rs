use crate::config::ResourceLimits;
use crate::workspace::{Workspace, WorkspaceState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Result of a version-guarded write.
#[derive(Debug, Clone)]
#[must_use = "a stale outcome means the write was not applied"]
pub enum TransitionOutcome {
    /// The write happened; carries the updated row.
    Applied(Workspace),
    /// The workspace moved on to `current_version` (or otherwise no longer
    /// matched); nothing was written.
    Stale { current_version: i64 },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn applied(self) -> Option<Workspace> {
        match self {
            TransitionOutcome::Applied(ws) => Some(ws),
            TransitionOutcome::Stale { .. } => None,
        }
    }
}

/// Launch parameters snapshotted into the registry when a launch begins.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub resource_limits: ResourceLimits,
    pub home_dir_path: PathBuf,
    pub message: String,
}

/// One row of `workspace_history`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub version: i64,
    pub state: WorkspaceState,
    pub message: String,
    pub at: DateTime<Utc>,
}
