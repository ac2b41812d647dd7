use super::locks::{OperationGate, WorkspaceLocks};
use super::readiness::ReadinessProbe;
use crate::config::HostConfig;
use crate::docker::{ContainerEngine, ContainerSpec};
use crate::error::{Error, Result};
use crate::lock_order;
use crate::logs::LogForwarder;
use crate::port::PortAllocator;
use crate::publisher::StatePublisher;
use crate::registry::{LaunchRecord, TransitionOutcome, WorkspaceRegistry};
use crate::workspace::{
    dir_size, validate_workspace_id, StateTransition, StopReason, Workspace, WorkspaceState,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// What a caller learns about a workspace after `launch` or `reset`.
///
/// A failed launch is not an `Err`: the workspace ends up `errored` and the
/// message says why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchResult {
    pub workspace_id: String,
    pub version: i64,
    pub state: WorkspaceState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl LaunchResult {
    fn from_workspace(ws: &Workspace, config: &HostConfig) -> Self {
        let running = ws.state == WorkspaceState::Running;
        Self {
            workspace_id: ws.id.clone(),
            version: ws.version,
            state: ws.state,
            message: ws.message.clone(),
            port: ws.assigned_port.filter(|_| running),
            base_url: running.then(|| config.base_url_for(&ws.id)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkspaceState::Running
    }
}

/// Resources a launch has taken so far, released if it fails.
#[derive(Debug, Default)]
struct Acquired {
    port: Option<u16>,
    container_ref: Option<String>,
}

/// Creates, starts and removes workspace containers.
///
/// # Concurrency
///
/// Every mutating operation holds, in order:
/// 1. the host [`OperationGate`] (shared)
/// 2. the workspace's own mutex
///
/// and passes the `version` it read to every registry write, so a write
/// from an operation that has been superseded is discarded instead of
/// applied.
pub struct Supervisor {
    config: Arc<HostConfig>,
    engine: Arc<dyn ContainerEngine>,
    publisher: Arc<StatePublisher>,
    ports: Arc<PortAllocator>,
    forwarder: Arc<LogForwarder>,
    probe: Arc<dyn ReadinessProbe>,
    gate: Arc<OperationGate>,
    locks: WorkspaceLocks,
    /// Launches in progress, with the version they launch and a token that
    /// aborts them.
    inflight: Mutex<HashMap<String, (i64, CancellationToken)>>,
    accepting: AtomicBool,
}

impl Supervisor {
    pub fn new(
        config: Arc<HostConfig>,
        engine: Arc<dyn ContainerEngine>,
        publisher: Arc<StatePublisher>,
        ports: Arc<PortAllocator>,
        forwarder: Arc<LogForwarder>,
        probe: Arc<dyn ReadinessProbe>,
        gate: Arc<OperationGate>,
    ) -> Self {
        Self {
            config,
            engine,
            publisher,
            ports,
            forwarder,
            probe,
            gate,
            locks: WorkspaceLocks::new(),
            inflight: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    fn registry(&self) -> &WorkspaceRegistry {
        self.publisher.registry()
    }

    pub fn locks(&self) -> &WorkspaceLocks {
        &self.locks
    }

    /// Refuse new launches from now on. Stops are still served.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Launch the workspace, or return the running one unchanged.
    pub async fn launch(&self, id: &str) -> Result<LaunchResult> {
        validate_workspace_id(id)?;
        self.ensure_accepting()?;

        lock_order::scope(async {
            let _gate = self.gate.shared().await;
            let _lock = self.locks.lock(id).await;
            // Shutdown may have started while we waited
            self.ensure_accepting()?;
            self.launch_locked(id).await
        })
        .instrument(tracing::info_span!("launch", workspace_id = %id))
        .await
    }

    /// Stop the workspace and remove its container. A no-op when nothing is
    /// running.
    pub async fn stop(&self, id: &str, reason: StopReason) -> Result<Workspace> {
        validate_workspace_id(id)?;

        lock_order::scope(async {
            let _gate = self.gate.shared().await;
            let _lock = self.locks.lock(id).await;
            self.stop_locked(id, reason).await
        })
        .instrument(tracing::info_span!("stop", workspace_id = %id, ?reason))
        .await
    }

    /// Stop then launch, without letting another operation in between.
    pub async fn reset(&self, id: &str) -> Result<LaunchResult> {
        validate_workspace_id(id)?;
        self.ensure_accepting()?;

        lock_order::scope(async {
            let _gate = self.gate.shared().await;
            let _lock = self.locks.lock(id).await;
            self.ensure_accepting()?;
            if self.registry().get(id).await?.is_some() {
                self.stop_locked(id, StopReason::Reset).await?;
            }
            self.launch_locked(id).await
        })
        .instrument(tracing::info_span!("reset", workspace_id = %id))
        .await
    }

    /// Stop a running workspace whose last heartbeat is older than `cutoff`.
    ///
    /// Returns false, without touching anything, if a heartbeat arrived in
    /// the meantime or the workspace was relaunched.
    pub async fn stop_idle(&self, id: &str, version: i64, cutoff: DateTime<Utc>) -> Result<bool> {
        lock_order::scope(async {
            let _gate = self.gate.shared().await;
            let _lock = self.locks.lock(id).await;

            let reason = StopReason::HeartbeatTimeout;
            let outcome = self
                .publisher
                .publish_idle_stop(id, version, cutoff, reason.stopping_message())
                .await?;
            match outcome {
                TransitionOutcome::Applied(ws) => {
                    info!("Workspace missed its heartbeat deadline, stopping");
                    self.teardown(ws, reason).await?;
                    Ok(true)
                }
                TransitionOutcome::Stale { .. } => {
                    debug!("Heartbeat arrived before the idle stop, keeping workspace");
                    Ok(false)
                }
            }
        })
        .instrument(tracing::info_span!("stop_idle", workspace_id = %id, version))
        .await
    }

    /// Abort a launch that has been in `launching` for too long.
    ///
    /// A launch still in progress is cancelled and fails with a timeout; a
    /// `launching` row with no launch behind it is torn down and ends
    /// `errored` as well.
    pub async fn stop_stuck_launch(&self, id: &str, version: i64) -> Result<()> {
        let token = self
            .inflight
            .lock()
            .get(id)
            .filter(|(v, _)| *v == version)
            .map(|(_, token)| token.clone());
        if let Some(token) = token {
            warn!(workspace_id = id, version, "Launch exceeded its deadline, cancelling");
            token.cancel();
            return Ok(());
        }

        lock_order::scope(async {
            let _gate = self.gate.shared().await;
            let Some(_lock) = self.locks.try_lock(id) else {
                debug!("Workspace busy, checking the stuck launch again later");
                return Ok(());
            };
            match self.registry().get(id).await? {
                Some(ws) if ws.state == WorkspaceState::Launching && ws.version == version => {
                    self.stop_locked(id, StopReason::LaunchTimeout).await.map(|_| ())
                }
                _ => Ok(()),
            }
        })
        .instrument(tracing::info_span!("stop_stuck_launch", workspace_id = %id, version))
        .await
    }

    // ========================================================================
    // Launch
    // ========================================================================

    async fn launch_locked(&self, id: &str) -> Result<LaunchResult> {
        let mut ws = self.registry().ensure(id).await?;

        match ws.state {
            WorkspaceState::Running => {
                debug!("Workspace already running");
                return Ok(LaunchResult::from_workspace(&ws, &self.config));
            }
            WorkspaceState::Launching | WorkspaceState::Stopping => {
                // Left over from an interrupted operation; finish it first
                ws = self.stop_locked(id, StopReason::Reset).await?;
            }
            _ => {}
        }

        let record = LaunchRecord {
            resource_limits: self.config.limits.clone(),
            home_dir_path: self.config.home_dir_for(id),
            message: "Launching workspace".to_string(),
        };
        let launched = match self.publisher.publish_launch(id, ws.version, record).await? {
            TransitionOutcome::Applied(launched) => launched,
            TransitionOutcome::Stale { .. } => {
                let current = self.registry().require(id).await?;
                return Ok(LaunchResult::from_workspace(&current, &self.config));
            }
        };
        let version = launched.version;
        info!(version, "Launching workspace");

        let token = CancellationToken::new();
        self.inflight
            .lock()
            .insert(id.to_string(), (version, token.clone()));

        let mut acquired = Acquired::default();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Timeout {
                operation: "starting the workspace".to_string(),
                secs: self.config.launch_timeout.as_secs(),
            }),
            result = self.provision(&launched, &mut acquired) => result,
        };
        self.inflight.lock().remove(id);

        let final_ws = match result {
            Ok(Some(ws)) => ws,
            Ok(None) => {
                debug!(version, "Launch superseded, releasing its resources");
                self.release(id, &acquired).await;
                self.registry().require(id).await?
            }
            Err(e) => {
                warn!(version, "Launch failed: {}", e);
                self.release(id, &acquired).await;
                match self
                    .publisher
                    .publish(id, Some(version), StateTransition::errored(e.user_message()))
                    .await?
                {
                    TransitionOutcome::Applied(ws) => ws,
                    TransitionOutcome::Stale { .. } => self.registry().require(id).await?,
                }
            }
        };

        Ok(LaunchResult::from_workspace(&final_ws, &self.config))
    }

    /// Bring up the container for `ws`, which has just entered `launching`.
    ///
    /// Returns `Ok(None)` if a registry write found the launch superseded.
    async fn provision(&self, ws: &Workspace, acquired: &mut Acquired) -> Result<Option<Workspace>> {
        let id = ws.id.as_str();
        let version = ws.version;
        let settings = ws.settings.resolve(id, &self.config.defaults)?;

        // At most one container per workspace: anything a previous launch
        // left behind must be gone before a port is taken
        self.remove_workspace_containers(id).await.map_err(|e| {
            Error::Cleanup(format!("Failed to remove previous container: {}", e.user_message()))
        })?;

        let port = self.ports.allocate()?;
        acquired.port = Some(port);
        let step = StateTransition::message_only(WorkspaceState::Launching, "Allocated port")
            .with_port(port);
        if !self.publisher.publish(id, Some(version), step).await?.is_applied() {
            return Ok(None);
        }

        self.progress(id, version, "Checking image").await;
        if !self.engine.image_exists(&settings.image).await? {
            self.progress(id, version, "Pulling image").await;
            self.engine.pull_image(&settings.image).await?;
        }

        let home_dir = self.config.home_dir_for(id);
        self.prepare_home_dir(&home_dir)?;

        self.progress(id, version, "Creating container").await;
        let mut env = BTreeMap::from([(
            "WORKSPACE_BASE_URL".to_string(),
            self.config.base_url_for(id),
        )]);
        env.extend(settings.env);
        let spec = ContainerSpec {
            name: format!("workspace-{}-v{}", id, version),
            image: settings.image,
            labels: ContainerSpec::workspace_labels(id, version),
            env,
            args: settings.args,
            host_port: port,
            container_port: settings.port,
            home_dir,
            home_mount: settings.home,
            user: Some((self.config.owner_uid, self.config.owner_gid)),
            limits: self.config.limits.clone(),
        };
        let container_ref = self.engine.create(&spec).await?;
        acquired.container_ref = Some(container_ref.clone());
        let step = StateTransition::message_only(WorkspaceState::Launching, "Starting container")
            .with_container(container_ref.clone());
        if !self.publisher.publish(id, Some(version), step).await?.is_applied() {
            return Ok(None);
        }

        self.engine.start(&container_ref).await?;

        self.progress(id, version, "Waiting for workspace to respond").await;
        self.wait_ready(id, port).await?;

        let outcome = self
            .publisher
            .publish(id, Some(version), StateTransition::running("Workspace is running"))
            .await?;
        Ok(outcome.applied())
    }

    async fn wait_ready(&self, id: &str, port: u16) -> Result<()> {
        let readiness = &self.config.readiness;
        let deadline = tokio::time::Instant::now() + readiness.timeout;
        loop {
            if self.probe.probe(port).await {
                return Ok(());
            }
            if tokio::time::Instant::now() + readiness.interval > deadline {
                return Err(Error::NotReady {
                    id: id.to_string(),
                    reason: format!(
                        "no response on port {} within {}s",
                        port,
                        readiness.timeout.as_secs()
                    ),
                });
            }
            tokio::time::sleep(readiness.interval).await;
        }
    }

    /// Create the home directory and, when running as root, hand it to the
    /// configured owner.
    fn prepare_home_dir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| {
            Error::Filesystem(format!("Failed to create {}: {}", path.display(), e))
        })?;

        if nix::unistd::geteuid().is_root() {
            nix::unistd::chown(
                path,
                Some(nix::unistd::Uid::from_raw(self.config.owner_uid)),
                Some(nix::unistd::Gid::from_raw(self.config.owner_gid)),
            )
            .map_err(|e| Error::Filesystem(format!("Failed to chown {}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    async fn progress(&self, id: &str, version: i64, message: &str) {
        if let Err(e) = self.publisher.update_message(id, version, message, true).await {
            warn!(workspace_id = id, "Failed to record progress '{}': {}", message, e);
        }
    }

    /// Best-effort release of what a failed or superseded launch acquired.
    async fn release(&self, id: &str, acquired: &Acquired) {
        if let Some(container_ref) = &acquired.container_ref {
            if let Err(e) = self.engine.remove(container_ref).await {
                warn!(workspace_id = id, "Failed to remove container {}: {}", container_ref, e);
            }
            self.forwarder.forget(container_ref);
        }
        // A cancelled create may have left a container we never learned about
        if let Err(e) = self.remove_workspace_containers(id).await {
            warn!(workspace_id = id, "Failed to clean up after launch: {}", e);
        }
        if let Some(port) = acquired.port {
            self.ports.release(port);
        }
    }

    // ========================================================================
    // Stop
    // ========================================================================

    async fn stop_locked(&self, id: &str, reason: StopReason) -> Result<Workspace> {
        let ws = self.registry().require(id).await?;

        match ws.state {
            WorkspaceState::Uninitialized | WorkspaceState::Stopped => Ok(ws),
            WorkspaceState::Stopping if reason != StopReason::Reset => Ok(ws),
            WorkspaceState::Stopping => self.teardown(ws, reason).await,
            WorkspaceState::Launching | WorkspaceState::Running | WorkspaceState::Errored => {
                let outcome = self
                    .publisher
                    .publish(
                        id,
                        Some(ws.version),
                        StateTransition::stopping(reason.stopping_message()),
                    )
                    .await?;
                match outcome {
                    TransitionOutcome::Applied(stopping) => self.teardown(stopping, reason).await,
                    TransitionOutcome::Stale { .. } => self.registry().require(id).await,
                }
            }
        }
    }

    /// Finish a stop for `ws`, which is in `stopping`: container stop,
    /// final log flush, removal, port release, then `stopped` (or `errored`
    /// for a launch that timed out).
    async fn teardown(&self, ws: Workspace, reason: StopReason) -> Result<Workspace> {
        let id = ws.id.as_str();

        let removed = match ws.container_ref.as_deref() {
            Some(container_ref) => {
                if let Err(e) = self.engine.stop(container_ref, self.config.stop_grace).await {
                    warn!(workspace_id = id, "Failed to stop container {}: {}", container_ref, e);
                }
                // Output written during the stop grace period is part of the archive
                match self.forwarder.flush_final(&ws).await {
                    Ok(outcome) => debug!(?outcome, "Final log flush"),
                    Err(e) => warn!(workspace_id = id, "Final log flush failed: {}", e),
                }
                let removed = self.engine.remove(container_ref).await.map_err(Error::from);
                self.forwarder.forget(container_ref);
                removed
            }
            None => self.remove_workspace_containers(id).await,
        };

        if let Some(port) = ws.assigned_port {
            self.ports.release(port);
        }

        let transition = match removed {
            Ok(()) => {
                self.record_disk_usage(&ws).await;
                reason.final_transition()
            }
            Err(e) => StateTransition::errored(format!(
                "Failed to remove container: {}",
                e.user_message()
            )),
        };
        match self
            .publisher
            .publish(id, Some(ws.version), transition)
            .await?
        {
            TransitionOutcome::Applied(done) => Ok(done),
            TransitionOutcome::Stale { .. } => self.registry().require(id).await,
        }
    }

    /// Measure the home directory once its container is gone. Failures are
    /// logged; the previous measurement stays.
    async fn record_disk_usage(&self, ws: &Workspace) {
        let home = ws
            .home_dir_path
            .clone()
            .unwrap_or_else(|| self.config.home_dir_for(&ws.id));
        let measured = tokio::task::spawn_blocking(move || dir_size(&home)).await;
        let bytes = match measured {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(workspace_id = %ws.id, "Failed to measure home directory: {}", e);
                return;
            }
            Err(e) => {
                warn!(workspace_id = %ws.id, "Disk usage task failed: {}", e);
                return;
            }
        };
        match self.registry().record_disk_usage(&ws.id, bytes).await {
            Ok(()) => debug!(workspace_id = %ws.id, bytes, "Recorded disk usage"),
            Err(e) => warn!(workspace_id = %ws.id, "Failed to record disk usage: {}", e),
        }
    }

    /// Remove every managed container labelled with `id`.
    async fn remove_workspace_containers(&self, id: &str) -> Result<()> {
        let containers = self.engine.list_managed().await?;
        for container in containers
            .iter()
            .filter(|c| c.workspace_id.as_deref() == Some(id))
        {
            info!(workspace_id = id, container = %container.name, "Removing leftover container");
            self.engine.remove(&container.id).await?;
            self.forwarder.forget(&container.id);
        }
        Ok(())
    }
}
