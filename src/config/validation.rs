use super::{BlobStoreConfig, HostConfig};
use crate::error::{Error, Result};
use std::time::Duration;

impl HostConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.port_range.is_empty() {
            return Err(Error::Validation(format!(
                "port_range is empty ({}..{}); max must be greater than min",
                self.port_range.min, self.port_range.max
            )));
        }
        if self.port_range.min == 0 {
            return Err(Error::Validation(
                "port_range.min must be at least 1".to_string(),
            ));
        }

        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("launch_timeout", self.launch_timeout),
            ("prune_interval", self.prune_interval),
            ("logs_flush_interval", self.logs_flush_interval),
            ("engine_timeout", self.engine_timeout),
            ("pull_timeout", self.pull_timeout),
            ("blob_timeout", self.blob_timeout),
            ("readiness.interval", self.readiness.interval),
            ("readiness.timeout", self.readiness.timeout),
            ("readiness.probe_timeout", self.readiness.probe_timeout),
        ];
        for (name, value) in intervals {
            if value == Duration::ZERO {
                return Err(Error::Validation(format!("{} must be greater than 0", name)));
            }
        }

        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(Error::Validation(format!(
                "heartbeat_timeout ({:?}) must not be shorter than heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }

        if self.launch_timeout <= self.readiness.timeout {
            return Err(Error::Validation(format!(
                "launch_timeout ({:?}) must be longer than readiness.timeout ({:?})",
                self.launch_timeout, self.readiness.timeout
            )));
        }

        self.limits
            .validate()
            .map_err(Error::Validation)?;

        if let Some(image) = &self.defaults.image {
            if image.trim().is_empty() {
                return Err(Error::Validation(
                    "defaults.image must not be empty".to_string(),
                ));
            }
        }
        if !self.defaults.home.starts_with('/') {
            return Err(Error::Validation(format!(
                "defaults.home must be an absolute path (got '{}')",
                self.defaults.home
            )));
        }

        if let BlobStoreConfig::Http { url, .. } = &self.blob_store {
            let parsed = url::Url::parse(url).map_err(|e| {
                Error::Validation(format!("blob_store.url '{}' is invalid: {}", url, e))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(Error::Validation(format!(
                    "blob_store.url must use http or https, got '{}'",
                    parsed.scheme()
                )));
            }
        }

        Ok(())
    }
}
