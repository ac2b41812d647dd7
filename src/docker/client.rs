//! Docker CLI client.
//!
//! All Docker CLI interactions go through `DockerClient`, which provides
//! consistent timeout handling, error mapping to [`DockerError`], and a single
//! point where `Command::new("docker")` is constructed.

use super::{ContainerEngine, ContainerSpec, ContainerSummary, DockerError, LABEL_MANAGED};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::process::Output;
use std::time::Duration;

/// [`ContainerEngine`] backed by the `docker` CLI.
///
/// Cheap to clone; holds only the deadlines applied to each call.
#[derive(Debug, Clone)]
pub struct DockerClient {
    binary: String,
    timeout: Duration,
    pull_timeout: Duration,
}

impl DockerClient {
    pub fn new(timeout: Duration, pull_timeout: Duration) -> Self {
        Self {
            binary: "docker".to_string(),
            timeout,
            pull_timeout,
        }
    }

    /// Use a different CLI binary (e.g. `podman`, which accepts the same flags).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// Run a docker command with a timeout, returning raw Output.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(&self.binary)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let cmd_str = format!("{} {}", self.binary, args.join(" "));

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DockerError::exec_failed(cmd_str, e)),
            Err(_) => Err(DockerError::timeout(cmd_str, timeout)),
        }
    }

    /// Run a docker command with a timeout, returning Output only if exit 0.
    async fn run_success(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let cmd_str = format!("{} {}", self.binary, args.first().copied().unwrap_or_default());
            Err(DockerError::failed(cmd_str, &output))
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerClient {
    async fn ping(&self) -> Result<(), DockerError> {
        match self
            .run(&["version", "--format", "{{.Server.Version}}"], self.timeout)
            .await
        {
            Ok(o) if o.status.success() => Ok(()),
            Ok(_) => Err(DockerError::DaemonUnavailable),
            Err(e @ DockerError::ExecFailed { .. }) => Err(e),
            Err(_) => Err(DockerError::DaemonUnavailable),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        let output = self
            .run(&["image", "inspect", "--format", "{{.Id}}", image], self.timeout)
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such image") {
            return Ok(false);
        }
        Err(DockerError::failed("docker image inspect", &output))
    }

    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        self.run_success(&["pull", "--quiet", image], self.pull_timeout)
            .await
            .map(|_| ())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let args = spec.to_create_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_success(&arg_refs, self.timeout).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(DockerError::unexpected(
                "docker create",
                "no container id on stdout",
            ));
        }
        Ok(id)
    }

    async fn start(&self, container: &str) -> Result<(), DockerError> {
        self.run_success(&["start", container], self.timeout)
            .await
            .map(|_| ())
    }

    async fn stop(&self, container: &str, grace: Duration) -> Result<(), DockerError> {
        let grace_secs = grace.as_secs().to_string();
        // The CLI waits out the grace period itself, so extend our deadline by it
        let output = self
            .run(&["stop", "-t", &grace_secs, container], self.timeout + grace)
            .await?;
        if output.status.success() {
            return Ok(());
        }
        match DockerError::failed("docker stop", &output) {
            // Already gone - not an error
            e if e.is_not_found() => Ok(()),
            e => Err(e),
        }
    }

    async fn remove(&self, container: &str) -> Result<(), DockerError> {
        let output = self.run(&["rm", "-f", container], self.timeout).await?;
        if output.status.success() {
            return Ok(());
        }
        match DockerError::failed("docker rm -f", &output) {
            e if e.is_not_found() => Ok(()),
            e => Err(e),
        }
    }

    async fn logs_between(
        &self,
        container: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<u8>, DockerError> {
        let since = since.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let until = until.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let output = self
            .run_success(
                &[
                    "logs",
                    "--timestamps",
                    "--since",
                    &since,
                    "--until",
                    &until,
                    container,
                ],
                self.timeout,
            )
            .await?;
        Ok(merge_timestamped_streams(&output.stdout, &output.stderr))
    }

    async fn list_managed(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        let filter = format!("label={}=true", LABEL_MANAGED);
        let format = ContainerSummary::ps_format();
        let output = self
            .run_success(
                &["ps", "-a", "--no-trunc", "--filter", &filter, "--format", &format],
                self.timeout,
            )
            .await?;
        ContainerSummary::parse_ps_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Interleave `docker logs --timestamps` stdout and stderr by timestamp.
///
/// The CLI writes the container's two streams to its own stdout/stderr, so
/// the ordering between them is lost. Every line starts with an RFC 3339
/// timestamp; lines without one keep the position of the line before them.
pub fn merge_timestamped_streams(stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
    fn tag(stream: &[u8]) -> Vec<(Option<DateTime<Utc>>, &[u8])> {
        let mut last = None;
        stream
            .split_inclusive(|b| *b == b'\n')
            .map(|line| {
                let ts = line
                    .split(|b| *b == b' ')
                    .next()
                    .and_then(|raw| std::str::from_utf8(raw).ok())
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                if ts.is_some() {
                    last = ts;
                }
                (last, line)
            })
            .collect()
    }

    let (out, err) = (tag(stdout), tag(stderr));
    let mut merged = Vec::with_capacity(stdout.len() + stderr.len());
    let (mut i, mut j) = (0, 0);
    while i < out.len() || j < err.len() {
        let take_out = match (out.get(i), err.get(j)) {
            (Some(a), Some(b)) => a.0 <= b.0,
            (Some(_), None) => true,
            _ => false,
        };
        if take_out {
            merged.extend_from_slice(out[i].1);
            i += 1;
        } else {
            merged.extend_from_slice(err[j].1);
            j += 1;
        }
    }
    merged
}
