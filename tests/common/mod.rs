//! Shared fixtures for the integration tests: an in-memory container engine,
//! a recording blob store, a controllable readiness probe, and a host wired
//! to all three.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use workspace_host::docker::{
    ContainerEngine, ContainerSpec, ContainerSummary, DockerError, LABEL_WORKSPACE_ID,
    LABEL_WORKSPACE_VERSION,
};
use workspace_host::logs::BlobStore;
use workspace_host::port::PortAllocator;
use workspace_host::registry::WorkspaceRegistry;
use workspace_host::supervisor::ReadinessProbe;
use workspace_host::{Error, HostComponents, HostConfig, WorkspaceHost};

pub const TEST_IMAGE: &str = "workspace/test:latest";

// =============================================================================
// Container engine
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
    pub spec: Option<ContainerSpec>,
    pub logs: Vec<(DateTime<Utc>, String)>,
}

/// Failure switches for [`FakeEngine`].
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub daemon_down: bool,
    pub pull_fails: bool,
    pub create_fails: bool,
    pub start_fails: bool,
    pub remove_fails: bool,
}

#[derive(Default)]
struct EngineState {
    containers: BTreeMap<String, FakeContainer>,
    images: HashSet<String>,
    next_id: u64,
    faults: Faults,
    create_delay: Option<Duration>,
    stop_output: Option<String>,
}

/// A container engine that keeps its containers in memory.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    pub create_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub pull_calls: AtomicUsize,
}

impl FakeEngine {
    /// An engine that already has [`TEST_IMAGE`].
    pub fn new() -> Arc<Self> {
        let engine = Self::default();
        engine.state.lock().images.insert(TEST_IMAGE.to_string());
        Arc::new(engine)
    }

    pub fn without_images() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().faults = faults;
    }

    pub fn update_faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.state.lock().faults);
    }

    /// Make every `create` take `delay` before it returns.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.state.lock().create_delay = delay;
    }

    /// A line every container writes while it is being stopped.
    pub fn set_stop_output(&self, line: &str) {
        self.state.lock().stop_output = Some(line.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().images.contains(image)
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().containers.values().cloned().collect()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(id).cloned()
    }

    pub fn containers_for(&self, workspace_id: &str) -> Vec<FakeContainer> {
        self.containers()
            .into_iter()
            .filter(|c| c.labels.get(LABEL_WORKSPACE_ID).map(String::as_str) == Some(workspace_id))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.containers().iter().filter(|c| c.running).count()
    }

    /// Append a log line to a container, stamped now.
    pub fn emit(&self, container: &str, line: &str) {
        if let Some(c) = self.state.lock().containers.get_mut(container) {
            c.logs.push((Utc::now(), line.to_string()));
        }
    }

    /// The container exits on its own.
    pub fn kill(&self, container: &str) {
        if let Some(c) = self.state.lock().containers.get_mut(container) {
            c.running = false;
        }
    }

    /// The container disappears without going through the host.
    pub fn vanish(&self, container: &str) {
        self.state.lock().containers.remove(container);
    }

    /// Add a managed container that no launch created.
    pub fn insert_container(&self, workspace_id: &str, version: i64, running: bool) -> String {
        let mut state = self.state.lock();
        let id = next_container_id(&mut state);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: format!("workspace-{}-v{}", workspace_id, version),
                running,
                labels: ContainerSpec::workspace_labels(workspace_id, version),
                spec: None,
                logs: Vec::new(),
            },
        );
        id
    }
}

fn next_container_id(state: &mut EngineState) -> String {
    state.next_id += 1;
    format!("{:064x}", 0xc0ffee_0000_u64 + state.next_id)
}

fn failed(command: &str) -> DockerError {
    DockerError::cmd_failed(command, "injected failure", Some(1))
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), DockerError> {
        if self.state.lock().faults.daemon_down {
            return Err(DockerError::DaemonUnavailable);
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        Ok(self.state.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.faults.pull_fails {
            return Err(failed("docker pull"));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.faults.create_fails {
            return Err(failed("docker create"));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(DockerError::cmd_failed(
                "docker create",
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
                Some(125),
            ));
        }
        let id = next_container_id(&mut state);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                running: false,
                labels: spec.labels.clone(),
                spec: Some(spec.clone()),
                logs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, container: &str) -> Result<(), DockerError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.faults.start_fails {
            return Err(failed("docker start"));
        }
        match state.containers.get_mut(container) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(DockerError::ContainerNotFound {
                container: container.to_string(),
            }),
        }
    }

    async fn stop(&self, container: &str, _grace: Duration) -> Result<(), DockerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let output = state.stop_output.clone();
        if let Some(c) = state.containers.get_mut(container) {
            if let Some(line) = output {
                c.logs.push((Utc::now(), line));
            }
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<(), DockerError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.faults.remove_fails {
            return Err(failed("docker rm"));
        }
        state.containers.remove(container);
        Ok(())
    }

    async fn logs_between(
        &self,
        container: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<u8>, DockerError> {
        let state = self.state.lock();
        let Some(c) = state.containers.get(container) else {
            return Err(DockerError::ContainerNotFound {
                container: container.to_string(),
            });
        };
        let mut out = Vec::new();
        for (at, line) in c.logs.iter().filter(|(at, _)| *at > since && *at <= until) {
            out.extend_from_slice(format!("{} {}\n", at.to_rfc3339(), line).as_bytes());
        }
        Ok(out)
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        let state = self.state.lock();
        if state.faults.daemon_down {
            return Err(DockerError::DaemonUnavailable);
        }
        Ok(state
            .containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                running: c.running,
                workspace_id: c.labels.get(LABEL_WORKSPACE_ID).cloned(),
                version: c
                    .labels
                    .get(LABEL_WORKSPACE_VERSION)
                    .and_then(|v| v.parse().ok()),
            })
            .collect())
    }
}

// =============================================================================
// Blob store
// =============================================================================

/// Keeps every uploaded object in memory.
#[derive(Default)]
pub struct RecordingBlobStore {
    objects: Mutex<Vec<(String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl RecordingBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn keys_for(&self, workspace_id: &str) -> Vec<String> {
        let prefix = format!("{}/", workspace_id);
        self.keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect()
    }

    /// Every uploaded body, in upload order, joined together.
    pub fn concatenated(&self) -> String {
        self.objects
            .lock()
            .iter()
            .map(|(_, body)| String::from_utf8_lossy(body).into_owned())
            .collect()
    }
}

#[async_trait]
impl BlobStore for RecordingBlobStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> workspace_host::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::BlobStore(format!("injected failure writing {}", key)));
        }
        self.objects.lock().push((key.to_string(), body));
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// =============================================================================
// Readiness
// =============================================================================

/// Readiness probe answering whatever the test last set.
pub struct ControlledProbe {
    ready: AtomicBool,
    pub probes: AtomicUsize,
}

impl ControlledProbe {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn never() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadinessProbe for ControlledProbe {
    async fn probe(&self, _port: u16) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.ready.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Host
// =============================================================================

pub struct Harness {
    pub host: Arc<WorkspaceHost>,
    pub engine: Arc<FakeEngine>,
    pub blobs: Arc<RecordingBlobStore>,
    pub probe: Arc<ControlledProbe>,
    pub config: HostConfig,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> HostConfig {
    let mut config = HostConfig::for_testing(dir.path());
    config.port_range.min = 30000;
    config.port_range.max = 30100;
    config
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(configure: impl FnOnce(&mut HostConfig)) -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = test_config(&dir);
    configure(&mut config);
    let engine = FakeEngine::new();
    let blobs = RecordingBlobStore::new();
    let probe = ControlledProbe::ready();
    let host = build_host(&config, &engine, &blobs, &probe).await;
    Harness {
        host,
        engine,
        blobs,
        probe,
        config,
        dir,
    }
}

pub async fn build_host(
    config: &HostConfig,
    engine: &Arc<FakeEngine>,
    blobs: &Arc<RecordingBlobStore>,
    probe: &Arc<ControlledProbe>,
) -> Arc<WorkspaceHost> {
    let registry = WorkspaceRegistry::open(&config.state_dir)
        .await
        .expect("Failed to open registry");
    let components = HostComponents {
        registry: Arc::new(registry),
        engine: Arc::clone(engine) as Arc<dyn ContainerEngine>,
        blob_store: Arc::clone(blobs) as Arc<dyn BlobStore>,
        probe: Arc::clone(probe) as Arc<dyn ReadinessProbe>,
    };
    let ports = PortAllocator::new(config.port_range, config.max_port_attempts).without_bind_check();
    Arc::new(WorkspaceHost::with_port_allocator(
        config.clone(),
        components,
        Some(ports),
    ))
}

impl Harness {
    /// Simulate a host restart: drop the host and build a new one over the
    /// same state directory and engine.
    pub async fn restart(self) -> Harness {
        let Harness {
            host,
            engine,
            blobs,
            probe,
            config,
            dir,
        } = self;
        drop(host);
        let host = build_host(&config, &engine, &blobs, &probe).await;
        Harness {
            host,
            engine,
            blobs,
            probe,
            config,
            dir,
        }
    }

    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        self.host.registry()
    }

    /// The container currently recorded for `id`.
    pub async fn container_of(&self, id: &str) -> Option<String> {
        self.registry()
            .get(id)
            .await
            .expect("registry read")
            .and_then(|ws| ws.container_ref)
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
