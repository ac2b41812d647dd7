use crate::config::{BlobStoreConfig, HostConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Destination for archived container logs.
///
/// One object is written per (workspace, flush window). Implementations must
/// treat a `put` to an existing key as an overwrite: a flush that failed
/// after the upload but before the watermark moved is retried with the same
/// key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Object key for the window starting at `window_start`. Keys of one
/// workspace sort chronologically.
pub fn blob_key(workspace_id: &str, window_start: DateTime<Utc>, version: i64) -> String {
    format!(
        "{}/{}-v{}.log",
        workspace_id,
        window_start.format("%Y%m%dT%H%M%S%.3fZ"),
        version
    )
}

/// Build the configured blob store.
pub fn from_config(config: &HostConfig) -> Result<Arc<dyn BlobStore>> {
    match &config.blob_store {
        BlobStoreConfig::Filesystem { path } => {
            let root = path.clone().unwrap_or_else(|| config.state_dir.join("logs"));
            Ok(Arc::new(FsBlobStore::new(root)))
        }
        BlobStoreConfig::Http { url, bearer_token } => Ok(Arc::new(HttpBlobStore::new(
            url,
            bearer_token.clone(),
            config.blob_timeout,
        )?)),
    }
}

/// Blob store writing each object to `{root}/{key}`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(Error::BlobStore(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::BlobStore(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        // Write then rename so readers never see a partial object
        let tmp = path.with_extension("log.partial");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| Error::BlobStore(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::BlobStore(format!("failed to move {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Blob store issuing `PUT {base_url}/{key}`.
pub struct HttpBlobStore {
    base_url: url::Url,
    bearer_token: Option<String>,
    client: Client,
    timeout: Duration,
}

impl HttpBlobStore {
    /// # Errors
    ///
    /// Returns error if `base_url` is malformed or not http(s).
    pub fn new(base_url: &str, bearer_token: Option<String>, timeout: Duration) -> Result<Self> {
        let mut parsed = url::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid blob store URL '{}': {}", base_url, e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::Config(format!(
                "Invalid blob store URL '{}': scheme must be http or https, got '{}'",
                base_url,
                parsed.scheme()
            )));
        }
        // Url::join replaces the last segment unless the path ends in '/'
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: parsed,
            bearer_token,
            client,
            timeout,
        })
    }

    pub fn url_for(&self, key: &str) -> Result<url::Url> {
        self.base_url
            .join(key)
            .map_err(|e| Error::BlobStore(format!("invalid object key '{}': {}", key, e)))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let url = self.url_for(key)?;
        let mut request = self
            .client
            .put(url.clone())
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::BlobStore(format!("PUT {} returned {}", url, status)));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.base_url.to_string()
    }
}
