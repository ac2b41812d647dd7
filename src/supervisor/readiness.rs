use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Decides whether a freshly started container is serving.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// One attempt against `port` on the host. Must return within the
    /// probe's own timeout.
    async fn probe(&self, port: u16) -> bool;
}

/// Probe that issues `GET http://{host}:{port}{path}`.
///
/// Any HTTP response counts as ready, including error statuses: the
/// workspace service answering at all is what matters, and many editors
/// redirect or require auth on `/`.
pub struct HttpProbe {
    client: Client,
    host: String,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> crate::error::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                crate::error::Error::Config(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            host: "127.0.0.1".to_string(),
            path: "/".to_string(),
            timeout,
        })
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    fn url_for(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, self.path)
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, port: u16) -> bool {
        self.client
            .get(self.url_for(port))
            .timeout(self.timeout)
            .send()
            .await
            .is_ok()
    }
}
