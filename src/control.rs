//! Newline-delimited JSON control protocol.
//!
//! `workspace-host serve` reads one request per line on stdin and writes one
//! JSON object per line on stdout: a response for each request, plus
//! `change:state` / `change:message` events for every subscribed workspace.
//!
//! ```text
//! > {"request_id": 1, "type": "startWorkspace", "workspace_id": "ws-42"}
//! < {"event": "change:state", "workspace_id": "ws-42", "state": "launching", "message": "Launching workspace"}
//! < {"event": "change:message", "workspace_id": "ws-42", "message": "Pulling image"}
//! < {"event": "change:state", "workspace_id": "ws-42", "state": "running", "message": "Workspace is running"}
//! < {"request_id": 1, "ok": true, "result": {"workspace_id": "ws-42", "state": "running", ...}}
//! > {"request_id": 2, "type": "heartbeat", "workspace_id": "ws-42"}
//! < {"request_id": 2, "ok": true, "result": {"ack": true}}
//! ```
//!
//! Events carry an `event` key; responses carry `ok`. Requests are handled
//! concurrently, so responses may arrive out of order.

use crate::error::{Error, Result};
use crate::host::WorkspaceHost;
use crate::publisher::WorkspaceEvent;
use crate::workspace::WorkspaceSettings;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One line of input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestEnvelope {
    /// Echoed back in the response.
    #[serde(default)]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "startWorkspace")]
    StartWorkspace { workspace_id: String },
    #[serde(rename = "heartbeat")]
    Heartbeat { workspace_id: String },
    #[serde(rename = "stopWorkspace")]
    StopWorkspace { workspace_id: String },
    #[serde(rename = "resetWorkspace")]
    ResetWorkspace { workspace_id: String },
    #[serde(rename = "configureWorkspace")]
    ConfigureWorkspace {
        workspace_id: String,
        #[serde(default)]
        settings: WorkspaceSettings,
    },
    #[serde(rename = "status")]
    Status { workspace_id: String },
    #[serde(rename = "history")]
    History { workspace_id: String },
    #[serde(rename = "subscribe")]
    Subscribe { workspace_id: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { workspace_id: String },
}

impl Request {
    fn workspace_id(&self) -> &str {
        match self {
            Request::StartWorkspace { workspace_id }
            | Request::Heartbeat { workspace_id }
            | Request::StopWorkspace { workspace_id }
            | Request::ResetWorkspace { workspace_id }
            | Request::ConfigureWorkspace { workspace_id, .. }
            | Request::Status { workspace_id }
            | Request::History { workspace_id }
            | Request::Subscribe { workspace_id }
            | Request::Unsubscribe { workspace_id } => workspace_id,
        }
    }

    /// Requests whose progress the client wants to see as events.
    fn subscribes(&self) -> bool {
        matches!(
            self,
            Request::StartWorkspace { .. }
                | Request::ResetWorkspace { .. }
                | Request::StopWorkspace { .. }
                | Request::Subscribe { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub request_id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Response {
    fn success(request_id: Option<u64>, result: Value) -> Self {
        Self {
            request_id,
            ok: true,
            result: Some(result),
            error: None,
            suggestion: None,
        }
    }

    fn failure(request_id: Option<u64>, error: &Error) -> Self {
        Self {
            request_id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
            suggestion: error.suggestion(),
        }
    }
}

/// Serves the protocol for one client over a reader/writer pair.
pub struct ControlServer {
    host: Arc<WorkspaceHost>,
    /// Event forwarding task per subscribed workspace.
    subscriptions: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ControlServer {
    pub fn new(host: Arc<WorkspaceHost>) -> Self {
        Self {
            host,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle requests from `input` until it ends, writing responses and
    /// events to `output`.
    pub async fn serve<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_until(input, output, CancellationToken::new())
            .await
    }

    /// Like [`serve`](Self::serve), but stop reading new requests once
    /// `shutdown` is cancelled.
    ///
    /// Requests already being handled run to completion and their responses
    /// are written before this returns, so a launch or stop is never cut off
    /// half-way with the workspace lock released.
    pub async fn serve_until<R, W>(
        &self,
        input: R,
        output: W,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(write_lines(rx, output));

        let mut inflight = JoinSet::new();
        let mut lines = input.lines();
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, no longer reading requests");
                    break;
                }
                next = lines.next_line() => next?,
            };
            let Some(line) = next else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let envelope = match serde_json::from_str::<RequestEnvelope>(line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    let err = Error::Protocol(format!("invalid request: {}", e));
                    send_json(&tx, &Response::failure(None, &err));
                    continue;
                }
            };

            let host = Arc::clone(&self.host);
            let subscriptions = Arc::clone(&self.subscriptions);
            let tx = tx.clone();
            inflight.spawn(async move {
                let response = handle(&host, &subscriptions, &tx, envelope).await;
                send_json(&tx, &response);
            });

            // Reap finished handlers so the set doesn't grow unbounded
            while inflight.try_join_next().is_some() {}
        }

        debug!(pending = inflight.len(), "Waiting for in-flight requests");
        while inflight.join_next().await.is_some() {}

        for (_, task) in self.subscriptions.lock().drain() {
            task.abort();
        }
        drop(tx);
        writer
            .await
            .map_err(|e| Error::Protocol(format!("output writer failed: {}", e)))??;
        Ok(())
    }
}

async fn handle(
    host: &WorkspaceHost,
    subscriptions: &Mutex<HashMap<String, JoinHandle<()>>>,
    tx: &mpsc::UnboundedSender<String>,
    envelope: RequestEnvelope,
) -> Response {
    let RequestEnvelope {
        request_id,
        request,
    } = envelope;

    if request.subscribes() {
        if let Err(e) = ensure_subscribed(host, subscriptions, tx, request.workspace_id()).await {
            return Response::failure(request_id, &e);
        }
    }

    let result = dispatch(host, subscriptions, request).await;
    match result {
        Ok(value) => Response::success(request_id, value),
        Err(e) => Response::failure(request_id, &e),
    }
}

async fn dispatch(
    host: &WorkspaceHost,
    subscriptions: &Mutex<HashMap<String, JoinHandle<()>>>,
    request: Request,
) -> Result<Value> {
    match request {
        Request::StartWorkspace { workspace_id } => {
            Ok(serde_json::to_value(host.start_workspace(&workspace_id).await?)?)
        }
        Request::Heartbeat { workspace_id } => {
            let ack = host.heartbeat(&workspace_id).await?;
            Ok(json!({ "ack": ack }))
        }
        Request::StopWorkspace { workspace_id } => {
            Ok(serde_json::to_value(host.stop_workspace(&workspace_id).await?)?)
        }
        Request::ResetWorkspace { workspace_id } => {
            Ok(serde_json::to_value(host.reset_workspace(&workspace_id).await?)?)
        }
        Request::ConfigureWorkspace {
            workspace_id,
            settings,
        } => Ok(serde_json::to_value(
            host.configure_workspace(&workspace_id, &settings).await?,
        )?),
        Request::Status { workspace_id } => {
            Ok(serde_json::to_value(host.status(&workspace_id).await?)?)
        }
        Request::History { workspace_id } => {
            Ok(serde_json::to_value(host.history(&workspace_id).await?)?)
        }
        Request::Subscribe { workspace_id } => {
            Ok(serde_json::to_value(host.status(&workspace_id).await?)?)
        }
        Request::Unsubscribe { workspace_id } => {
            let removed = subscriptions.lock().remove(&workspace_id);
            if let Some(task) = &removed {
                task.abort();
            }
            Ok(json!({ "unsubscribed": removed.is_some() }))
        }
    }
}

/// Start forwarding events of `id` to the client, once per workspace.
async fn ensure_subscribed(
    host: &WorkspaceHost,
    subscriptions: &Mutex<HashMap<String, JoinHandle<()>>>,
    tx: &mpsc::UnboundedSender<String>,
    id: &str,
) -> Result<()> {
    if subscriptions
        .lock()
        .get(id)
        .is_some_and(|task| !task.is_finished())
    {
        return Ok(());
    }

    let mut subscription = host.subscribe(id).await?;
    let tx = tx.clone();
    let workspace_id = id.to_string();
    let task = tokio::spawn(async move {
        loop {
            match subscription.events.recv().await {
                Ok(event) => {
                    if !send_json(&tx, &event) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(workspace_id = %workspace_id, missed, "Client fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Two requests may race here; keep the first forwarder
    let mut subscriptions = subscriptions.lock();
    match subscriptions.get(id) {
        Some(existing) if !existing.is_finished() => task.abort(),
        _ => {
            subscriptions.insert(id.to_string(), task);
        }
    }
    Ok(())
}

/// Queue one JSON line. Returns false once the writer is gone.
fn send_json<T: Serialize>(tx: &mpsc::UnboundedSender<String>, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(line) => tx.send(line).is_ok(),
        Err(e) => {
            warn!("Failed to encode control message: {}", e);
            true
        }
    }
}

async fn write_lines<W>(mut rx: mpsc::UnboundedReceiver<String>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}

/// Parse one request line; exposed for tests and tooling.
pub fn parse_request(line: &str) -> Result<RequestEnvelope> {
    serde_json::from_str(line).map_err(|e| Error::Protocol(format!("invalid request: {}", e)))
}

/// Encode an event exactly as `serve` writes it.
pub fn encode_event(event: &WorkspaceEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_request() {
        let envelope =
            parse_request(r#"{"request_id": 7, "type": "startWorkspace", "workspace_id": "ws1"}"#)
                .unwrap();
        assert_eq!(envelope.request_id, Some(7));
        assert_eq!(
            envelope.request,
            Request::StartWorkspace {
                workspace_id: "ws1".to_string()
            }
        );
        assert!(envelope.request.subscribes());
    }

    #[test]
    fn test_parse_heartbeat_without_request_id() {
        let envelope = parse_request(r#"{"type": "heartbeat", "workspace_id": "ws1"}"#).unwrap();
        assert_eq!(envelope.request_id, None);
        assert!(!envelope.request.subscribes());
    }

    #[test]
    fn test_parse_configure_with_settings() {
        let envelope = parse_request(
            r#"{"type": "configureWorkspace", "workspace_id": "ws1",
                "settings": {"image": "workspace/jupyter:3", "port": 8888}}"#,
        )
        .unwrap();
        match envelope.request {
            Request::ConfigureWorkspace { settings, .. } => {
                assert_eq!(settings.image.as_deref(), Some("workspace/jupyter:3"));
                assert_eq!(settings.port, Some(8888));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = parse_request(r#"{"type": "explode", "workspace_id": "ws1"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_failure_response_carries_suggestion() {
        let response = Response::failure(Some(3), &Error::WorkspaceNotFound("ws9".to_string()));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["request_id"], 3);
        assert!(json["suggestion"].as_str().unwrap().contains("ws9"));
        assert!(json.get("result").is_none());
    }
}
