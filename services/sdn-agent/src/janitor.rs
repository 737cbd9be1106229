//! Stale interface cleanup.
//!
//! Periodically lists host interfaces with a managed prefix and deletes the
//! ones no live workload owns, once they have stayed unowned for the grace
//! period.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{jittered, sleep_or_cancel};
use crate::config::JanitorConfig;

/// Default sysfs directory listing network interfaces.
pub const SYSFS_NET: &str = "/sys/class/net";

/// Host link enumeration and removal.
#[async_trait]
pub trait LinkManager: Send + Sync {
    async fn list_links(&self) -> Result<Vec<String>>;
    async fn delete_link(&self, name: &str) -> Result<()>;
}

/// Lists links from sysfs and deletes them with `ip link delete`.
#[derive(Debug, Clone)]
pub struct SysfsLinkManager {
    root: PathBuf,
}

impl SysfsLinkManager {
    pub fn new() -> Self {
        Self::with_root(SYSFS_NET)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsLinkManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkManager for SysfsLinkManager {
    async fn list_links(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list {}", self.root.display()))?;

        let mut links = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                links.push(name.to_string());
            }
        }
        links.sort();
        Ok(links)
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let output = Command::new("ip")
            .args(["link", "delete", name])
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to execute ip command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ip link delete {} failed: {}", name, stderr.trim());
        }
        Ok(())
    }
}

/// Outcome of one janitor pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JanitorReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    /// Unowned but still inside the grace period.
    pub pending: Vec<String>,
}

/// Removes managed interfaces that no workload owns.
pub struct InterfaceJanitor {
    links: Arc<dyn LinkManager>,
    config: JanitorConfig,
    known: watch::Receiver<Option<BTreeSet<String>>>,
    first_seen: HashMap<String, Instant>,
}

impl InterfaceJanitor {
    /// `known` carries the interface names owned by live workloads; `None`
    /// until membership has been observed once.
    pub fn new(
        links: Arc<dyn LinkManager>,
        config: JanitorConfig,
        known: watch::Receiver<Option<BTreeSet<String>>>,
    ) -> Self {
        Self {
            links,
            config,
            known,
            first_seen: HashMap::new(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            grace_secs = self.config.grace.as_secs(),
            prefixes = ?self.config.prefixes.as_slice(),
            "Interface janitor started"
        );

        let ready = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            res = self.known.wait_for(Option::is_some) => res.is_ok(),
        };

        if ready {
            loop {
                let report = self.pass(Instant::now(), &token).await;
                if !report.removed.is_empty() || !report.failed.is_empty() {
                    info!(
                        removed = report.removed.len(),
                        failed = report.failed.len(),
                        pending = report.pending.len(),
                        "Janitor pass complete"
                    );
                }

                let delay = jittered(self.config.interval, self.config.jitter);
                if !sleep_or_cancel(delay, &token).await {
                    break;
                }
            }
        }

        info!("Interface janitor stopped");
    }

    /// Run one scan at `now`.
    ///
    /// Individual removal failures are recorded and retried next pass.
    /// Nothing is deleted once `token` is cancelled.
    pub async fn pass(&mut self, now: Instant, token: &CancellationToken) -> JanitorReport {
        let mut report = JanitorReport::default();

        let Some(known) = self.known.borrow().clone() else {
            debug!("Membership not observed yet, skipping janitor pass");
            return report;
        };

        let links = match self.links.list_links().await {
            Ok(links) => links,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to list host interfaces");
                return report;
            }
        };

        let unowned: BTreeSet<String> = links
            .into_iter()
            .filter(|name| self.config.prefixes.is_managed(name) && !known.contains(name))
            .collect();

        // Forget interfaces that were deleted elsewhere or became owned.
        self.first_seen.retain(|name, _| unowned.contains(name));

        for name in unowned {
            let first = *self.first_seen.entry(name.clone()).or_insert(now);
            if now.saturating_duration_since(first) < self.config.grace {
                report.pending.push(name);
                continue;
            }

            if token.is_cancelled() {
                break;
            }

            match self.links.delete_link(&name).await {
                Ok(()) => {
                    info!(ifname = %name, "Removed stale interface");
                    self.first_seen.remove(&name);
                    report.removed.push(name);
                }
                Err(e) => {
                    warn!(ifname = %name, error = %format!("{e:#}"), "Failed to remove stale interface");
                    report.failed.push(name);
                }
            }
        }

        report
    }
}
