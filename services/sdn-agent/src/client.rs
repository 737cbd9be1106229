//! Control plane authentication client.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error};

use crate::host_config::HostConfig;

/// Authenticates this host against the control plane.
#[derive(Debug, Clone)]
pub struct AuthClient {
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    username: Option<&'a str>,
    password: Option<&'a str>,
    project: Option<&'a str>,
    zone: &'a str,
}

impl AuthClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client })
    }

    /// POST the host's credentials to `<auth_url>/v1/hosts/<host_id>/auth`.
    pub async fn authenticate(&self, auth_url: &str, config: &HostConfig) -> Result<()> {
        let url = format!(
            "{}/v1/hosts/{}/auth",
            auth_url.trim_end_matches('/'),
            config.host_id
        );
        debug!(url = %url, host_id = %config.host_id, "Authenticating host");

        let request = AuthRequest {
            username: config.username.as_deref(),
            password: config.password.as_deref(),
            project: config.project.as_deref(),
            zone: &config.zone,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Host authentication rejected");
            anyhow::bail!("authentication rejected: {} - {}", status, body);
        }

        Ok(())
    }
}
