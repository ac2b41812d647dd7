//! Client heartbeats and idle shutdown.
//!
//! A browser tab with the workspace open sends a heartbeat every
//! `heartbeat_interval`. Recording one is a single conditional UPDATE, with
//! no engine I/O and no workspace lock. A background sweep stops `running`
//! workspaces whose last heartbeat is older than `heartbeat_timeout`, and
//! aborts launches that have been `launching` for longer than
//! `launch_timeout`.
//!
//! Workspaces that have not sent a heartbeat since they started are exempt
//! from the idle check, giving the client time to connect.

use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::registry::WorkspaceRegistry;
use crate::supervisor::Supervisor;
use crate::workspace::validate_workspace_id;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idle_stopped: usize,
    pub stuck_launches: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<WorkspaceRegistry>,
    supervisor: Arc<Supervisor>,
    timeout: Duration,
    launch_timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        supervisor: Arc<Supervisor>,
        config: &HostConfig,
    ) -> Self {
        Self {
            registry,
            supervisor,
            timeout: config.heartbeat_timeout,
            launch_timeout: config.launch_timeout,
        }
    }

    /// Record a heartbeat. Returns true (ack) only if the workspace is running.
    pub async fn record(&self, id: &str) -> Result<bool> {
        validate_workspace_id(id)?;
        let accepted = self.registry.record_heartbeat(id, Utc::now()).await?;
        if !accepted {
            debug!(workspace_id = id, "Heartbeat ignored, workspace not running");
        }
        Ok(accepted)
    }

    /// One pass over the registry.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let cutoff = cutoff_for(now, self.timeout)?;
        let stale = self.registry.stale_heartbeats(cutoff).await?;
        let stops = stale.iter().map(|ws| async move {
            match self.supervisor.stop_idle(&ws.id, ws.version, cutoff).await {
                Ok(stopped) => stopped,
                Err(e) => {
                    warn!(workspace_id = %ws.id, "Failed to stop idle workspace: {}", e);
                    false
                }
            }
        });
        report.idle_stopped = join_all(stops).await.into_iter().filter(|s| *s).count();

        let launch_cutoff = cutoff_for(now, self.launch_timeout)?;
        let stuck = self.registry.stuck_launches(launch_cutoff).await?;
        report.stuck_launches = stuck.len();
        let aborts = stuck.iter().map(|ws| async move {
            if let Err(e) = self.supervisor.stop_stuck_launch(&ws.id, ws.version).await {
                warn!(workspace_id = %ws.id, "Failed to abort stuck launch: {}", e);
            }
        });
        join_all(aborts).await;

        Ok(report)
    }
}

fn cutoff_for(now: DateTime<Utc>, age: Duration) -> Result<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age)
        .map_err(|e| Error::Config(format!("duration out of range: {}", e)))?;
    Ok(now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC))
}
