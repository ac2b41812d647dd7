//! Reconciliation of the registry with the containers that actually exist.
//!
//! Runs once at startup (crash recovery) and then every `prune_interval`,
//! holding the host-wide operation gate exclusively so that no launch or
//! stop is half-way through while it compares the two views.

use crate::docker::{ContainerEngine, ContainerSummary};
use crate::error::Result;
use crate::lock_order;
use crate::logs::LogForwarder;
use crate::port::PortAllocator;
use crate::publisher::StatePublisher;
use crate::registry::TransitionOutcome;
use crate::supervisor::OperationGate;
use crate::workspace::{StateTransition, Workspace, WorkspaceState};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Message given to a running workspace whose container disappeared.
pub const CONTAINER_GONE_MESSAGE: &str =
    "Workspace container is no longer running. Click \"Reboot\" to try again.";
const LAUNCH_INTERRUPTED_MESSAGE: &str =
    "Workspace launch was interrupted. Click \"Reboot\" to try again.";
const STOP_RECOVERED_MESSAGE: &str = "Workspace stopped";

/// What one prune pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// True when the engine was unreachable and nothing was compared.
    pub skipped: bool,
    pub orphans_removed: usize,
    pub running_errored: usize,
    pub launches_recovered: usize,
    pub stops_recovered: usize,
    pub ports_reserved: usize,
    pub ports_released: usize,
}

pub struct HostPruner {
    engine: Arc<dyn ContainerEngine>,
    publisher: Arc<StatePublisher>,
    ports: Arc<PortAllocator>,
    forwarder: Arc<LogForwarder>,
    gate: Arc<OperationGate>,
}

impl HostPruner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        publisher: Arc<StatePublisher>,
        ports: Arc<PortAllocator>,
        forwarder: Arc<LogForwarder>,
        gate: Arc<OperationGate>,
    ) -> Self {
        Self {
            engine,
            publisher,
            ports,
            forwarder,
            gate,
        }
    }

    /// Run one reconciliation pass.
    pub async fn prune(&self) -> Result<PruneReport> {
        lock_order::scope(async {
            let _gate = self.gate.exclusive().await;
            self.prune_locked().await
        })
        .instrument(tracing::info_span!("prune"))
        .await
    }

    async fn prune_locked(&self) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        if let Err(e) = self.engine.ping().await {
            warn!("Container engine unavailable, skipping prune: {}", e);
            report.skipped = true;
            return Ok(report);
        }

        let containers = self.engine.list_managed().await?;
        let active = self.publisher.registry().list_active().await?;

        // Containers no active workspace claims
        for container in &containers {
            if active.iter().any(|ws| owns(ws, container)) {
                continue;
            }
            info!(container = %container.name, workspace_id = ?container.workspace_id, "Removing orphaned container");
            match self.forwarder.flush_orphan(container).await {
                Ok(outcome) => debug!(container = %container.name, ?outcome, "Archived orphan logs"),
                Err(e) => warn!(container = %container.name, "Failed to archive orphan logs: {}", e),
            }
            match self.engine.remove(&container.id).await {
                Ok(()) => report.orphans_removed += 1,
                Err(e) => warn!("Failed to remove orphaned container {}: {}", container.id, e),
            }
            self.forwarder.forget(&container.id);
        }

        let mut surviving_ports = HashSet::new();
        for ws in &active {
            let container = containers.iter().find(|c| owns(ws, c));
            match ws.state {
                WorkspaceState::Running => match container {
                    Some(c) if c.running => {
                        if let Some(port) = ws.assigned_port {
                            surviving_ports.insert(port);
                            if self.ports.reserve(port) {
                                report.ports_reserved += 1;
                            }
                        }
                    }
                    _ => {
                        warn!(workspace_id = %ws.id, "Container is no longer running");
                        self.remove_quietly(ws).await;
                        if self
                            .mark(ws, StateTransition::errored(CONTAINER_GONE_MESSAGE))
                            .await?
                        {
                            report.running_errored += 1;
                        }
                    }
                },
                WorkspaceState::Launching => {
                    info!(workspace_id = %ws.id, "Recovering interrupted launch");
                    self.remove_quietly(ws).await;
                    if self
                        .mark(ws, StateTransition::errored(LAUNCH_INTERRUPTED_MESSAGE))
                        .await?
                    {
                        report.launches_recovered += 1;
                    }
                }
                WorkspaceState::Stopping => {
                    info!(workspace_id = %ws.id, "Recovering interrupted stop");
                    if container.is_some() {
                        if let Err(e) = self.forwarder.flush_final(ws).await {
                            warn!(workspace_id = %ws.id, "Final log flush failed: {}", e);
                        }
                    }
                    self.remove_quietly(ws).await;
                    if self
                        .mark(ws, StateTransition::stopped(STOP_RECOVERED_MESSAGE))
                        .await?
                    {
                        report.stops_recovered += 1;
                    }
                }
                _ => {}
            }
        }

        // Anything still marked taken belongs to nobody
        for port in self.ports.taken_ports() {
            if !surviving_ports.contains(&port) {
                self.ports.release(port);
                report.ports_released += 1;
            }
        }

        debug!(?report, "Prune finished");
        Ok(report)
    }

    async fn remove_quietly(&self, ws: &Workspace) {
        if let Some(container_ref) = ws.container_ref.as_deref() {
            if let Err(e) = self.engine.remove(container_ref).await {
                warn!(workspace_id = %ws.id, "Failed to remove container {}: {}", container_ref, e);
            }
            self.forwarder.forget(container_ref);
        }
    }

    /// Unguarded transition: the exclusive gate keeps every other writer out.
    async fn mark(&self, ws: &Workspace, transition: StateTransition) -> Result<bool> {
        let outcome = self.publisher.publish(&ws.id, None, transition).await?;
        Ok(matches!(outcome, TransitionOutcome::Applied(_)))
    }
}

/// A container belongs to `ws` when both the workspace label and the
/// recorded container reference agree.
fn owns(ws: &Workspace, container: &ContainerSummary) -> bool {
    container.workspace_id.as_deref() == Some(ws.id.as_str())
        && ws
            .container_ref
            .as_deref()
            .is_some_and(|r| container.matches_ref(r))
}
