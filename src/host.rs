//! Wiring of the host components and their background loops.
//!
//! [`WorkspaceHost`] builds every component from one [`HostConfig`], runs
//! startup recovery, spawns the heartbeat, log and prune loops, and exposes
//! the inbound operations (`start`, `heartbeat`, `stop`, `reset`,
//! `subscribe`, `status`).
//!
//! # Shutdown
//!
//! [`WorkspaceHost::shutdown`] stops accepting launches, cancels the loops,
//! waits for in-flight operations by taking the operation gate exclusively,
//! and archives the logs of every remaining container. Containers keep
//! running; the next start recovers them.

use crate::config::HostConfig;
use crate::docker::{ContainerEngine, DockerClient};
use crate::error::Result;
use crate::heartbeat::HeartbeatMonitor;
use crate::lock_order;
use crate::logs::{self, BlobStore, LogForwarder};
use crate::port::PortAllocator;
use crate::pruner::{HostPruner, PruneReport};
use crate::publisher::{StatePublisher, Subscription};
use crate::registry::{HistoryEntry, WorkspaceRegistry};
use crate::supervisor::{HttpProbe, LaunchResult, OperationGate, ReadinessProbe, Supervisor};
use crate::workspace::{validate_workspace_id, StopReason, Workspace, WorkspaceSettings};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// External dependencies of the host, injectable for tests.
pub struct HostComponents {
    pub registry: Arc<WorkspaceRegistry>,
    pub engine: Arc<dyn ContainerEngine>,
    pub blob_store: Arc<dyn BlobStore>,
    pub probe: Arc<dyn ReadinessProbe>,
}

impl HostComponents {
    /// Production components: SQLite registry in `state_dir`, the `docker`
    /// CLI, the configured blob store and an HTTP readiness probe.
    pub async fn from_config(config: &HostConfig) -> Result<Self> {
        let registry = Arc::new(WorkspaceRegistry::open(&config.state_dir).await?);
        let engine = Arc::new(DockerClient::new(config.engine_timeout, config.pull_timeout));
        let blob_store = logs::from_config(config)?;
        let probe = Arc::new(HttpProbe::new(config.readiness.probe_timeout)?);
        Ok(Self {
            registry,
            engine,
            blob_store,
            probe,
        })
    }
}

pub struct WorkspaceHost {
    config: Arc<HostConfig>,
    registry: Arc<WorkspaceRegistry>,
    publisher: Arc<StatePublisher>,
    ports: Arc<PortAllocator>,
    forwarder: Arc<LogForwarder>,
    supervisor: Arc<Supervisor>,
    heartbeat: Arc<HeartbeatMonitor>,
    pruner: Arc<HostPruner>,
    gate: Arc<OperationGate>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    /// Ensures shutdown runs once even if called from several places.
    shutdown_started: AtomicBool,
}

impl WorkspaceHost {
    /// Build a host with production components.
    pub async fn open(config: HostConfig) -> Result<Self> {
        let components = HostComponents::from_config(&config).await?;
        Ok(Self::with_components(config, components))
    }

    pub fn with_components(config: HostConfig, components: HostComponents) -> Self {
        Self::with_port_allocator(config, components, None)
    }

    /// Like [`with_components`](Self::with_components), with a preconfigured
    /// allocator (tests disable its bind check).
    pub fn with_port_allocator(
        config: HostConfig,
        components: HostComponents,
        ports: Option<PortAllocator>,
    ) -> Self {
        let config = Arc::new(config);
        let HostComponents {
            registry,
            engine,
            blob_store,
            probe,
        } = components;

        let ports = Arc::new(ports.unwrap_or_else(|| {
            PortAllocator::new(config.port_range, config.max_port_attempts)
        }));
        let gate = Arc::new(OperationGate::new());
        let publisher = Arc::new(StatePublisher::new(
            Arc::clone(&registry),
            config.message_rate_limit,
        ));
        let forwarder = Arc::new(LogForwarder::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
            blob_store,
            config.blob_timeout,
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&config),
            Arc::clone(&engine),
            Arc::clone(&publisher),
            Arc::clone(&ports),
            Arc::clone(&forwarder),
            probe,
            Arc::clone(&gate),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            &config,
        ));
        let pruner = Arc::new(HostPruner::new(
            engine,
            Arc::clone(&publisher),
            Arc::clone(&ports),
            Arc::clone(&forwarder),
            Arc::clone(&gate),
        ));

        Self {
            config,
            registry,
            publisher,
            ports,
            forwarder,
            supervisor,
            heartbeat,
            pruner,
            gate,
            cancel: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Recover from the previous run, then start the background loops.
    pub async fn start(&self) -> Result<PruneReport> {
        let report = self.pruner.prune().await?;
        info!(
            orphans = report.orphans_removed,
            errored = report.running_errored,
            launches = report.launches_recovered,
            stops = report.stops_recovered,
            ports = report.ports_reserved,
            "Startup reconciliation complete"
        );

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(report);
        }

        let mut tasks = self.tasks.lock().await;

        let heartbeat = Arc::clone(&self.heartbeat);
        tasks.push(spawn_periodic(
            "heartbeat",
            self.config.heartbeat_interval,
            self.cancel.child_token(),
            move || {
                let heartbeat = Arc::clone(&heartbeat);
                async move { heartbeat.sweep().await.map(|_| ()) }
            },
        ));

        let forwarder = Arc::clone(&self.forwarder);
        tasks.push(spawn_periodic(
            "log forwarder",
            self.config.logs_flush_interval,
            self.cancel.child_token(),
            move || {
                let forwarder = Arc::clone(&forwarder);
                async move { forwarder.flush_cycle().await }
            },
        ));

        let pruner = Arc::clone(&self.pruner);
        let supervisor = Arc::clone(&self.supervisor);
        tasks.push(spawn_periodic(
            "pruner",
            self.config.prune_interval,
            self.cancel.child_token(),
            move || {
                let pruner = Arc::clone(&pruner);
                let supervisor = Arc::clone(&supervisor);
                async move {
                    pruner.prune().await?;
                    supervisor.locks().prune_idle();
                    Ok(())
                }
            },
        ));

        Ok(report)
    }

    // ========================================================================
    // Inbound operations
    // ========================================================================

    pub async fn start_workspace(&self, id: &str) -> Result<LaunchResult> {
        self.supervisor.launch(id).await
    }

    /// Returns the ack: true while the workspace is running.
    pub async fn heartbeat(&self, id: &str) -> Result<bool> {
        self.heartbeat.record(id).await
    }

    pub async fn stop_workspace(&self, id: &str) -> Result<Workspace> {
        self.supervisor.stop(id, StopReason::Requested).await
    }

    pub async fn reset_workspace(&self, id: &str) -> Result<LaunchResult> {
        self.supervisor.reset(id).await
    }

    /// Store container settings used by the next launch.
    pub async fn configure_workspace(
        &self,
        id: &str,
        settings: &WorkspaceSettings,
    ) -> Result<Workspace> {
        validate_workspace_id(id)?;
        self.registry.configure(id, settings).await
    }

    pub async fn subscribe(&self, id: &str) -> Result<Subscription> {
        self.publisher.subscribe(id).await
    }

    pub async fn status(&self, id: &str) -> Result<Workspace> {
        validate_workspace_id(id)?;
        self.registry.require(id).await
    }

    pub async fn list(&self) -> Result<Vec<Workspace>> {
        self.registry.list().await
    }

    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        validate_workspace_id(id)?;
        self.registry.history(id).await
    }

    /// Run a reconciliation pass now.
    pub async fn prune(&self) -> Result<PruneReport> {
        self.pruner.prune().await
    }

    /// Stop taking work, wait for in-flight operations and archive logs.
    /// Containers are left running.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return Ok(());
        }
        info!("Shutting down workspace host");

        self.supervisor.stop_accepting();
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background loop ended abnormally: {}", e);
            }
        }

        lock_order::scope(async {
            let _gate = self.gate.exclusive().await;
            self.forwarder.flush_all().await
        })
        .await?;

        info!("Workspace host stopped");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn forwarder(&self) -> &Arc<LogForwarder> {
        &self.forwarder
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn heartbeat_monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }
}

impl std::fmt::Debug for WorkspaceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceHost")
            .field("state_dir", &self.config.state_dir)
            .field("port_range", &self.config.port_range)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Run `tick` every `period` until `cancel` fires.
///
/// A failing tick is logged and the loop continues; so does a panicking one,
/// so a bug in one cycle cannot silently end supervision.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup has just reconciled
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{} loop shutting down", name);
                    break;
                }
                _ = interval.tick() => {
                    match AssertUnwindSafe(tick()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("{} cycle failed: {}", name, e),
                        Err(panic_info) => {
                            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                                s.to_string()
                            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                                s.clone()
                            } else {
                                "Unknown panic".to_string()
                            };
                            error!("{} cycle panicked: {}. Continuing...", name, panic_msg);
                        }
                    }
                }
            }
        }
    })
}
