use super::HostConfig;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default config file name looked up next to the binary's working directory.
pub const DEFAULT_CONFIG_FILE: &str = "workspace-host.yaml";

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the config path: an explicit path wins, then
    /// `workspace-host.yaml` (or `.yml`) in the current directory.
    /// Returns `None` when nothing is found so the caller can run on defaults.
    pub fn find_config_file(&self, explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file '{}' does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path.to_path_buf()));
        }

        let current_dir = std::env::current_dir()?;
        for name in [DEFAULT_CONFIG_FILE, "workspace-host.yml"] {
            let candidate = current_dir.join(name);
            if candidate.exists() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Load and validate a config file.
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<HostConfig> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        self.parse_config(&content)
    }

    pub fn parse_config(&self, content: &str) -> Result<HostConfig> {
        // An empty document deserializes to `null`; treat it as "all defaults".
        let config: HostConfig = if content.trim().is_empty() {
            HostConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
