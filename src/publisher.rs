//! Persist-then-broadcast of workspace state.
//!
//! Every state change goes to the registry first and is only broadcast once
//! committed, so subscribers never see a state the registry doesn't hold. A
//! crash between the two steps only loses the broadcast; the next
//! [`StatePublisher::subscribe`] snapshot carries the committed value.

use crate::error::Result;
use crate::registry::{LaunchRecord, TransitionOutcome, WorkspaceRegistry};
use crate::workspace::{validate_workspace_id, StateTransition, Workspace, WorkspaceState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHANNEL_CAPACITY: usize = 64;

/// Event delivered to subscribers of one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WorkspaceEvent {
    #[serde(rename = "change:state")]
    StateChanged {
        workspace_id: String,
        state: WorkspaceState,
        message: String,
    },
    #[serde(rename = "change:message")]
    MessageChanged {
        workspace_id: String,
        message: String,
    },
}

impl WorkspaceEvent {
    pub fn workspace_id(&self) -> &str {
        match self {
            WorkspaceEvent::StateChanged { workspace_id, .. }
            | WorkspaceEvent::MessageChanged { workspace_id, .. } => workspace_id,
        }
    }
}

/// Current state plus a stream of later changes.
pub struct Subscription {
    pub snapshot: Workspace,
    pub events: broadcast::Receiver<WorkspaceEvent>,
}

pub struct StatePublisher {
    registry: Arc<WorkspaceRegistry>,
    channels: Mutex<HashMap<String, broadcast::Sender<WorkspaceEvent>>>,
    /// Last time a progress message was written to the registry, per workspace.
    last_persisted: Mutex<HashMap<String, Instant>>,
    message_rate_limit: Duration,
}

impl StatePublisher {
    pub fn new(registry: Arc<WorkspaceRegistry>, message_rate_limit: Duration) -> Self {
        Self {
            registry,
            channels: Mutex::new(HashMap::new()),
            last_persisted: Mutex::new(HashMap::new()),
            message_rate_limit,
        }
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    /// Persist `transition` and, if it was applied, broadcast it:
    /// `change:message` for a message-only step, `change:state` otherwise.
    ///
    /// `expected_version = None` skips the version guard; only recovery,
    /// which runs with every other operation excluded, passes `None`.
    pub async fn publish(
        &self,
        id: &str,
        expected_version: Option<i64>,
        transition: StateTransition,
    ) -> Result<TransitionOutcome> {
        let message_only = transition.message_only;
        let outcome = self
            .registry
            .apply_transition(id, expected_version, transition)
            .await?;
        match &outcome {
            TransitionOutcome::Applied(ws) if message_only => {
                self.send(WorkspaceEvent::MessageChanged {
                    workspace_id: ws.id.clone(),
                    message: ws.message.clone(),
                });
            }
            _ => self.announce(&outcome),
        }
        Ok(outcome)
    }

    /// Persist the start of a new launch and broadcast `launching`.
    pub async fn publish_launch(
        &self,
        id: &str,
        expected_version: i64,
        launch: LaunchRecord,
    ) -> Result<TransitionOutcome> {
        let outcome = self
            .registry
            .begin_launch(id, expected_version, launch)
            .await?;
        self.announce(&outcome);
        Ok(outcome)
    }

    /// Persist a heartbeat-timeout `running -> stopping` and broadcast it.
    /// Stale if a heartbeat arrived after `cutoff`.
    pub async fn publish_idle_stop(
        &self,
        id: &str,
        expected_version: i64,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<TransitionOutcome> {
        let outcome = self
            .registry
            .begin_idle_stop(id, expected_version, cutoff, message)
            .await?;
        self.announce(&outcome);
        Ok(outcome)
    }

    /// Report progress without a state change.
    ///
    /// The message is broadcast. With `persist` it is also written to the
    /// registry, but no more often than the configured rate limit. Nothing
    /// happens if the workspace has moved past `version`, whether or not the
    /// message is persisted.
    pub async fn update_message(
        &self,
        id: &str,
        version: i64,
        message: &str,
        persist: bool,
    ) -> Result<()> {
        let current = if persist && self.should_persist(id) {
            self.registry.set_message(id, version, message).await?
        } else {
            self.registry
                .get(id)
                .await?
                .is_some_and(|ws| ws.version == version)
        };
        if !current {
            debug!(workspace_id = id, version, "Dropping message for superseded launch");
            return Ok(());
        }
        self.send(WorkspaceEvent::MessageChanged {
            workspace_id: id.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    /// Subscribe to a workspace, registering it if unknown.
    ///
    /// The receiver is created before the snapshot is read, so any change
    /// committed after the snapshot is also delivered as an event.
    pub async fn subscribe(&self, id: &str) -> Result<Subscription> {
        validate_workspace_id(id)?;
        let events = self.sender(id).subscribe();
        let snapshot = self.registry.ensure(id).await?;
        Ok(Subscription { snapshot, events })
    }

    pub fn subscriber_count(&self, id: &str) -> usize {
        self.channels
            .lock()
            .get(id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn announce(&self, outcome: &TransitionOutcome) {
        if let TransitionOutcome::Applied(ws) = outcome {
            info!(
                workspace_id = %ws.id,
                version = ws.version,
                state = %ws.state,
                "{}",
                ws.message
            );
            self.send(WorkspaceEvent::StateChanged {
                workspace_id: ws.id.clone(),
                state: ws.state,
                message: ws.message.clone(),
            });
            if !ws.state.has_container() {
                self.last_persisted.lock().remove(&ws.id);
            }
        }
    }

    fn should_persist(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_persisted.lock();
        match last.get(id) {
            Some(at) if now.duration_since(*at) < self.message_rate_limit => false,
            _ => {
                last.insert(id.to_string(), now);
                true
            }
        }
    }

    fn sender(&self, id: &str) -> broadcast::Sender<WorkspaceEvent> {
        self.channels
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn send(&self, event: WorkspaceEvent) {
        let mut channels = self.channels.lock();
        let Some(tx) = channels.get(event.workspace_id()) else {
            return;
        };
        // Best effort: an error only means nobody is listening
        if tx.send(event.clone()).is_err() || tx.receiver_count() == 0 {
            channels.remove(event.workspace_id());
        }
    }
}
