use super::blob::{blob_key, BlobStore};
use crate::docker::{ContainerEngine, ContainerSummary};
use crate::error::{Error, Result};
use crate::lock_order::{track_lock_acquisition, track_lock_release, LockId};
use crate::registry::WorkspaceRegistry;
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-container flush lock.
type FlushLock = Arc<tokio::sync::Mutex<()>>;

/// What a single flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Logs were uploaded under `key` and the watermark advanced.
    Uploaded { key: String, bytes: usize },
    /// The window held no output; the watermark advanced without an upload.
    Empty,
    /// Nothing was done: the container is being torn down, another flush
    /// holds the lock, or the workspace no longer owns the container.
    Skipped,
}

pub struct LogForwarder {
    registry: Arc<WorkspaceRegistry>,
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn BlobStore>,
    blob_timeout: Duration,
    locks: Mutex<HashMap<String, FlushLock>>,
    /// Containers whose final flush has started; the periodic loop leaves them alone.
    tearing_down: Mutex<HashSet<String>>,
}

impl LogForwarder {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn BlobStore>,
        blob_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            store,
            blob_timeout,
            locks: Mutex::new(HashMap::new()),
            tearing_down: Mutex::new(HashSet::new()),
        }
    }

    /// One pass of the periodic loop over every workspace with a container.
    ///
    /// Failures are logged and retried on the next pass with the same window.
    pub async fn flush_cycle(&self) -> Result<()> {
        let workspaces = self.registry.list_active().await?;
        let flushes = workspaces
            .iter()
            .filter(|ws| ws.container_ref.is_some())
            .map(|ws| async move {
                if let Err(e) = self.flush_periodic(ws).await {
                    warn!(workspace_id = %ws.id, "Log flush failed, will retry: {}", e);
                }
            });
        join_all(flushes).await;
        Ok(())
    }

    /// Flush one container unless it is being torn down or already being
    /// flushed.
    pub async fn flush_periodic(&self, ws: &Workspace) -> Result<FlushOutcome> {
        let Some(container_ref) = ws.container_ref.as_deref() else {
            return Ok(FlushOutcome::Skipped);
        };
        if self.tearing_down.lock().contains(container_ref) {
            debug!(workspace_id = %ws.id, "Skipping log flush for container being torn down");
            return Ok(FlushOutcome::Skipped);
        }

        let lock = self.lock_for(container_ref);
        let Ok(_guard) = lock.try_lock() else {
            debug!(workspace_id = %ws.id, "Log flush already in progress");
            return Ok(FlushOutcome::Skipped);
        };
        self.flush_locked(&ws.id, container_ref).await
    }

    /// Final flush before a container is removed.
    ///
    /// Marks the container as tearing down, waits for any in-progress
    /// periodic flush of it, then archives everything up to now. The caller
    /// must call [`forget`](Self::forget) once the container is gone.
    pub async fn flush_final(&self, ws: &Workspace) -> Result<FlushOutcome> {
        let Some(container_ref) = ws.container_ref.as_deref() else {
            return Ok(FlushOutcome::Skipped);
        };
        self.tearing_down.lock().insert(container_ref.to_string());

        let lock = self.lock_for(container_ref);
        track_lock_acquisition(LockId::FlushLock);
        let result = {
            let _guard = lock.lock().await;
            self.flush_locked(&ws.id, container_ref).await
        };
        track_lock_release(LockId::FlushLock);
        result
    }

    /// Flush every container the registry still lists, waiting for locks.
    /// Used at shutdown.
    pub async fn flush_all(&self) -> Result<()> {
        let workspaces = self.registry.list_active().await?;
        let flushes = workspaces
            .iter()
            .filter_map(|ws| ws.container_ref.as_deref().map(|c| (ws, c)))
            .map(|(ws, container_ref)| async move {
                let lock = self.lock_for(container_ref);
                let _guard = lock.lock().await;
                if let Err(e) = self.flush_locked(&ws.id, container_ref).await {
                    warn!(workspace_id = %ws.id, "Final log flush failed: {}", e);
                }
            });
        join_all(flushes).await;
        Ok(())
    }

    /// Archive everything an orphaned container wrote before the pruner
    /// removes it.
    ///
    /// No registry row tracks the container any more, so there is no
    /// watermark: the whole output goes into one object keyed by the
    /// workspace id and version from the container's labels.
    pub async fn flush_orphan(&self, container: &ContainerSummary) -> Result<FlushOutcome> {
        let (Some(id), Some(version)) = (container.workspace_id.as_deref(), container.version)
        else {
            return Ok(FlushOutcome::Skipped);
        };

        let lock = self.lock_for(&container.id);
        track_lock_acquisition(LockId::FlushLock);
        let result = {
            let _guard = lock.lock().await;
            self.flush_untracked(id, version, &container.id).await
        };
        track_lock_release(LockId::FlushLock);
        result
    }

    /// Drop bookkeeping for a removed container.
    pub fn forget(&self, container_ref: &str) {
        self.tearing_down.lock().remove(container_ref);
        self.locks.lock().remove(container_ref);
    }

    pub fn is_tearing_down(&self, container_ref: &str) -> bool {
        self.tearing_down.lock().contains(container_ref)
    }

    fn lock_for(&self, container_ref: &str) -> FlushLock {
        Arc::clone(
            self.locks
                .lock()
                .entry(container_ref.to_string())
                .or_default(),
        )
    }

    /// Archive `[watermark, now]` for `container_ref`. Caller holds its flush lock.
    async fn flush_locked(&self, id: &str, container_ref: &str) -> Result<FlushOutcome> {
        // Re-read under the lock: a flush that just finished moved the watermark
        let Some(ws) = self.registry.get(id).await? else {
            return Ok(FlushOutcome::Skipped);
        };
        if ws.container_ref.as_deref() != Some(container_ref) {
            return Ok(FlushOutcome::Skipped);
        }
        let Some(since) = ws.log_watermark() else {
            return Ok(FlushOutcome::Skipped);
        };
        let until = Utc::now();
        if until <= since {
            return Ok(FlushOutcome::Empty);
        }

        let logs = self.engine.logs_between(container_ref, since, until).await?;
        if logs.is_empty() {
            self.registry
                .advance_log_watermark(id, container_ref, until)
                .await?;
            return Ok(FlushOutcome::Empty);
        }

        let key = blob_key(id, since, ws.version);
        let bytes = logs.len();
        self.upload(&key, logs).await?;

        self.registry
            .advance_log_watermark(id, container_ref, until)
            .await?;
        debug!(workspace_id = id, key = %key, bytes, "Archived container logs");
        Ok(FlushOutcome::Uploaded { key, bytes })
    }

    /// Archive the full output of a container the registry no longer tracks.
    async fn flush_untracked(&self, id: &str, version: i64, container_ref: &str) -> Result<FlushOutcome> {
        let logs = self
            .engine
            .logs_between(container_ref, DateTime::<Utc>::UNIX_EPOCH, Utc::now())
            .await?;
        if logs.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let window_start = first_timestamp(&logs).unwrap_or_else(Utc::now);
        let key = blob_key(id, window_start, version);
        let bytes = logs.len();
        self.upload(&key, logs).await?;
        debug!(workspace_id = id, key = %key, bytes, "Archived orphaned container logs");
        Ok(FlushOutcome::Uploaded { key, bytes })
    }

    async fn upload(&self, key: &str, body: Vec<u8>) -> Result<()> {
        match tokio::time::timeout(self.blob_timeout, self.store.put(key, body)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("uploading logs to {}", self.store.describe()),
                secs: self.blob_timeout.as_secs(),
            }),
        }
    }
}

/// Timestamp at the start of the first line of `--timestamps` output.
fn first_timestamp(logs: &[u8]) -> Option<DateTime<Utc>> {
    let first_line = logs.split(|b| *b == b'\n').next()?;
    let stamp = first_line.split(|b| *b == b' ').next()?;
    let stamp = std::str::from_utf8(stamp).ok()?;
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
