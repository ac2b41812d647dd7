use super::{DockerError, LABEL_MANAGED, LABEL_WORKSPACE_ID, LABEL_WORKSPACE_VERSION};
use crate::config::ResourceLimits;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything needed to create one workspace container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
    /// Host port published to `container_port`.
    pub host_port: u16,
    pub container_port: u16,
    /// Host directory mounted at `home_mount`.
    pub home_dir: PathBuf,
    pub home_mount: String,
    /// `uid:gid` the container process runs as.
    pub user: Option<(u32, u32)>,
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    /// Labels identifying a container as belonging to `workspace_id` at `version`.
    pub fn workspace_labels(workspace_id: &str, version: i64) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_WORKSPACE_ID.to_string(), workspace_id.to_string()),
            (LABEL_WORKSPACE_VERSION.to_string(), version.to_string()),
        ])
    }

    /// Arguments for `docker create`, excluding the leading `docker`.
    pub fn to_create_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            self.name.clone(),
            // Workspaces never share IPC namespaces and never write core dumps
            "--ipc".to_string(),
            "private".to_string(),
            "--ulimit".to_string(),
            "core=0".to_string(),
            "-p".to_string(),
            format!("{}:{}", self.host_port, self.container_port),
            "-v".to_string(),
            format!("{}:{}", self.home_dir.display(), self.home_mount),
        ];

        if let Some((uid, gid)) = self.user {
            args.push("--user".to_string());
            args.push(format!("{}:{}", uid, gid));
        }

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.extend(self.limits.to_docker_args());
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// One row of `docker ps` for a managed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub workspace_id: Option<String>,
    pub version: Option<i64>,
}

impl ContainerSummary {
    /// Go template passed to `docker ps --format`; [`Self::parse_line`] reads it back.
    pub fn ps_format() -> String {
        format!(
            "{{{{.ID}}}}\t{{{{.Names}}}}\t{{{{.State}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.Label \"{}\"}}}}",
            LABEL_WORKSPACE_ID, LABEL_WORKSPACE_VERSION
        )
    }

    pub fn parse_line(line: &str) -> Result<Self, DockerError> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 5 {
            return Err(DockerError::unexpected(
                "docker ps",
                format!("expected 5 tab-separated fields, got {}: {:?}", fields.len(), line),
            ));
        }
        let non_empty = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        Ok(Self {
            id: fields[0].trim().to_string(),
            name: fields[1].trim().to_string(),
            running: fields[2].trim() == "running",
            workspace_id: non_empty(fields[3]),
            version: fields[4].trim().parse().ok(),
        })
    }

    pub fn parse_ps_output(stdout: &str) -> Result<Vec<Self>, DockerError> {
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(Self::parse_line)
            .collect()
    }

    /// Engine ids may be abbreviated; compare on the shorter of the two.
    pub fn matches_ref(&self, container_ref: &str) -> bool {
        !container_ref.is_empty()
            && (self.id.starts_with(container_ref) || container_ref.starts_with(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ContainerSpec {
        ContainerSpec {
            name: "workspace-ws1-v3".to_string(),
            image: "workspace/vscode:1".to_string(),
            labels: ContainerSpec::workspace_labels("ws1", 3),
            env: BTreeMap::from([(
                "WORKSPACE_BASE_URL".to_string(),
                "/pl/workspace/ws1/container/".to_string(),
            )]),
            args: vec!["--auth".to_string(), "none".to_string()],
            host_port: 20001,
            container_port: 8080,
            home_dir: PathBuf::from("/srv/workspaces/ws1"),
            home_mount: "/home/coder".to_string(),
            user: Some((1001, 1001)),
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_create_args_layout() {
        let args = sample_spec().to_create_args();
        let joined = args.join(" ");

        assert_eq!(args[0], "create");
        assert!(joined.contains("--name workspace-ws1-v3"));
        assert!(joined.contains("-p 20001:8080"));
        assert!(joined.contains("-v /srv/workspaces/ws1:/home/coder"));
        assert!(joined.contains("--user 1001:1001"));
        assert!(joined.contains("--ipc private"));
        assert!(joined.contains("--ulimit core=0"));
        assert!(joined.contains("--label workspace-host.workspace-id=ws1"));
        assert!(joined.contains("--label workspace-host.workspace-version=3"));
        assert!(joined.contains("--env WORKSPACE_BASE_URL=/pl/workspace/ws1/container/"));
        assert!(joined.contains("--pids-limit 1024"));

        // Image comes after every flag, followed by the container args
        let image_pos = args.iter().position(|a| a == "workspace/vscode:1").unwrap();
        assert_eq!(&args[image_pos + 1..], ["--auth", "none"]);
    }

    #[test]
    fn test_parse_ps_output() {
        let stdout = "abc123\tworkspace-ws1-v3\trunning\tws1\t3\n\
                      def456\tworkspace-ws2-v1\texited\tws2\t1\n\
                      \n\
                      0a0a0a\tstray\tcreated\t\t\n";
        let rows = ContainerSummary::parse_ps_output(stdout).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].running);
        assert_eq!(rows[0].workspace_id.as_deref(), Some("ws1"));
        assert_eq!(rows[0].version, Some(3));
        assert!(!rows[1].running);
        assert_eq!(rows[2].workspace_id, None);
        assert_eq!(rows[2].version, None);
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(ContainerSummary::parse_line("just-an-id").is_err());
    }

    #[test]
    fn test_ps_format_has_five_fields() {
        let format = ContainerSummary::ps_format();
        assert_eq!(format.matches('\t').count(), 4);
        assert!(format.contains("{{.Label \"workspace-host.workspace-id\"}}"));
    }

    #[test]
    fn test_matches_ref_accepts_short_ids() {
        let row = ContainerSummary {
            id: "abc123def456".to_string(),
            name: "n".to_string(),
            running: true,
            workspace_id: None,
            version: None,
        };
        assert!(row.matches_ref("abc123"));
        assert!(row.matches_ref("abc123def456789"));
        assert!(!row.matches_ref("zzz"));
        assert!(!row.matches_ref(""));
    }
}
