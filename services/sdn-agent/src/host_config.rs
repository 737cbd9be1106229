//! Host identity, credentials and the restart-on-change watcher.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::sleep_or_cancel;
use crate::client::AuthClient;

/// Host-level configuration, read from a TOML file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub host_id: String,
    pub zone: String,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("host_id", &self.host_id)
            .field("zone", &self.zone)
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("project", &self.project)
            .finish()
    }
}

impl HostConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(text).context("invalid host config")?;
        if config.host_id.trim().is_empty() {
            anyhow::bail!("host_id must not be empty");
        }
        Ok(config)
    }
}

/// Source of host identity and change detection.
#[async_trait]
pub trait HostConfigSource: Send + Sync {
    /// Resolve the current host configuration.
    async fn load(&self) -> Result<HostConfig>;

    /// Authenticate against the control plane.
    async fn authenticate(&self, config: &HostConfig) -> Result<()>;

    /// Opaque value that changes whenever the configuration changes.
    async fn fingerprint(&self) -> Result<String>;
}

/// Host configuration backed by a TOML file.
#[derive(Debug)]
pub struct FileHostConfigSource {
    path: PathBuf,
    client: AuthClient,
}

impl FileHostConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            client: AuthClient::new()?,
        })
    }

    async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))
    }
}

#[async_trait]
impl HostConfigSource for FileHostConfigSource {
    async fn load(&self) -> Result<HostConfig> {
        let bytes = self.read().await?;
        let text = String::from_utf8(bytes)
            .with_context(|| format!("{} is not valid UTF-8", self.path.display()))?;
        HostConfig::parse(&text)
    }

    async fn authenticate(&self, config: &HostConfig) -> Result<()> {
        match &config.auth_url {
            Some(url) => self.client.authenticate(url, config).await,
            None => {
                warn!(host_id = %config.host_id, "No auth_url configured, skipping authentication");
                Ok(())
            }
        }
    }

    async fn fingerprint(&self) -> Result<String> {
        let bytes = self.read().await?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Polls the host configuration and fires a callback when it changes.
pub struct HostConfigWatcher {
    source: Arc<dyn HostConfigSource>,
    interval: Duration,
}

impl HostConfigWatcher {
    pub fn new(source: Arc<dyn HostConfigSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Poll until the fingerprint differs from `baseline` or `token` fires.
    ///
    /// `on_change` runs at most once.
    pub async fn run<F>(self, baseline: String, token: CancellationToken, on_change: F)
    where
        F: FnOnce() + Send,
    {
        info!(interval_secs = self.interval.as_secs(), "Host config watcher started");

        while sleep_or_cancel(self.interval, &token).await {
            match self.source.fingerprint().await {
                Ok(current) if current != baseline => {
                    warn!(
                        previous = %baseline,
                        current = %current,
                        "Host configuration changed, stopping agent for restart"
                    );
                    on_change();
                    break;
                }
                Ok(_) => debug!("Host configuration unchanged"),
                Err(e) => warn!(error = %e, "Failed to fingerprint host configuration"),
            }
        }

        info!("Host config watcher stopped");
    }
}
