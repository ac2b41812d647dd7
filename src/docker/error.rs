use std::fmt;
use std::time::Duration;

/// Structured error type for container engine operations.
///
/// Each variant maps to one way an engine call can go wrong, so the
/// supervisor can turn any of them into an `errored` workspace with a
/// message that names the failing step.
#[derive(Debug)]
pub enum DockerError {
    /// Engine command exceeded its deadline.
    Timeout { command: String, timeout: Duration },

    /// Engine command ran but returned non-zero exit.
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// The `docker` binary couldn't be executed (not in PATH, permission denied).
    ExecFailed {
        command: String,
        source: std::io::Error,
    },

    /// Container doesn't exist (parsed from "No such container" stderr).
    ContainerNotFound { container: String },

    /// Engine output could not be understood.
    UnexpectedOutput { command: String, detail: String },

    /// Docker daemon not responding.
    DaemonUnavailable,
}

impl DockerError {
    /// Create a timeout error.
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        DockerError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Create a command-failed error from an `std::process::Output`.
    ///
    /// "No such container" and daemon connection failures are recognised and
    /// mapped to their dedicated variants.
    pub fn failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Self::cmd_failed(cmd, stderr, output.status.code())
    }

    /// Create a command-failed error from a stderr string and optional exit code.
    pub fn cmd_failed(
        cmd: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        let stderr = stderr.into();
        if let Some(rest) = stderr.split("No such container:").nth(1) {
            return DockerError::ContainerNotFound {
                container: rest.trim().to_string(),
            };
        }
        if stderr.contains("Cannot connect to the Docker daemon") {
            return DockerError::DaemonUnavailable;
        }
        DockerError::CommandFailed {
            command: cmd.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an exec-failed error (binary not found / permission denied).
    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        DockerError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }

    pub fn unexpected(cmd: impl Into<String>, detail: impl Into<String>) -> Self {
        DockerError::UnexpectedOutput {
            command: cmd.into(),
            detail: detail.into(),
        }
    }

    /// True if the container the command referred to is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DockerError::ContainerNotFound { .. })
    }
}

impl fmt::Display for DockerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DockerError::Timeout { command, timeout } => {
                write!(
                    f,
                    "Timed out running '{}' (exceeded {} seconds)",
                    command,
                    timeout.as_secs()
                )
            }
            DockerError::CommandFailed {
                command,
                stderr,
                exit_code,
            } => {
                if let Some(code) = exit_code {
                    write!(f, "'{}' failed (exit code {}): {}", command, code, stderr)
                } else {
                    write!(f, "'{}' failed: {}", command, stderr)
                }
            }
            DockerError::ExecFailed { command, source } => {
                write!(f, "Failed to execute '{}': {}", command, source)
            }
            DockerError::ContainerNotFound { container } => {
                write!(f, "No such container: {}", container)
            }
            DockerError::UnexpectedOutput { command, detail } => {
                write!(f, "Unexpected output from '{}': {}", command, detail)
            }
            DockerError::DaemonUnavailable => {
                write!(f, "Docker daemon is not responding")
            }
        }
    }
}

impl std::error::Error for DockerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DockerError::ExecFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
