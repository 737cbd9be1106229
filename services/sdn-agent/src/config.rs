//! Configuration for the SDN agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use sdnagent_networking::InterfacePrefixes;

use crate::backoff::BackoffPolicy;

/// Default location of the control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/sdnagent/sdnagent.sock";

/// Which virtual switch implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchBackend {
    /// Open vSwitch via `ovs-vsctl` / `ovs-ofctl`.
    Ovs,
    /// In-memory switch (dry run).
    Mock,
}

impl FromStr for SwitchBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ovs" => Ok(Self::Ovs),
            "mock" => Ok(Self::Mock),
            other => bail!("unknown switch backend: {other}"),
        }
    }
}

/// SDN agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket the RPC surface is served on.
    pub socket_path: PathBuf,

    /// Host configuration file (identity and credentials).
    pub host_config_path: PathBuf,

    /// Directory holding one descriptor per workload scheduled on this host.
    pub servers_dir: PathBuf,

    /// Virtual switch backend.
    pub switch_backend: SwitchBackend,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub worker: WorkerConfig,
    pub watch: WatchConfig,
    pub janitor: JanitorConfig,
}

/// Per-bridge worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Mailbox capacity of each worker.
    pub mailbox_size: usize,

    /// Retry backoff for failed sync passes.
    pub backoff: BackoffPolicy,

    /// How often a steady worker re-verifies the switch.
    pub resync_interval: Duration,

    /// Consecutive failures after which the worker reports itself degraded.
    pub report_threshold: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mailbox_size: 64,
            backoff: BackoffPolicy::default(),
            resync_interval: Duration::from_secs(30),
            report_threshold: 5,
        }
    }
}

/// Poll intervals of the membership and host-config watchers.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub membership_interval: Duration,
    pub host_config_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            membership_interval: Duration::from_secs(5),
            host_config_interval: Duration::from_secs(10),
        }
    }
}

/// Interface janitor settings.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Base interval between scans.
    pub interval: Duration,

    /// Fraction of the interval added as random jitter (0.0 to 1.0).
    pub jitter: f64,

    /// How long an interface must stay unknown before it is removed.
    pub grace: Duration,

    /// Interfaces outside these prefixes are never touched.
    pub prefixes: InterfacePrefixes,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            jitter: 0.1,
            grace: Duration::from_secs(300),
            prefixes: InterfacePrefixes::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let socket_path = std::env::var("SDNAGENT_SOCKET_PATH")
            .unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string())
            .into();

        let host_config_path = std::env::var("SDNAGENT_HOST_CONFIG")
            .unwrap_or_else(|_| "/etc/sdnagent/host.toml".to_string())
            .into();

        let servers_dir = std::env::var("SDNAGENT_SERVERS_DIR")
            .unwrap_or_else(|_| "/opt/cloud/workspace/servers".to_string())
            .into();

        let switch_backend = match std::env::var("SDNAGENT_SWITCH") {
            Ok(s) => s.parse()?,
            Err(_) => SwitchBackend::Ovs,
        };

        let log_level = std::env::var("SDNAGENT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let worker = WorkerConfig {
            resync_interval: env_interval("SDNAGENT_FLOW_RESYNC_INTERVAL", 30)?,
            report_threshold: env_or("SDNAGENT_FLOW_REPORT_THRESHOLD", 5),
            ..WorkerConfig::default()
        };

        let watch = WatchConfig {
            membership_interval: env_interval("SDNAGENT_MEMBERSHIP_INTERVAL", 5)?,
            host_config_interval: env_interval("SDNAGENT_HOST_CONFIG_INTERVAL", 10)?,
        };

        let janitor = JanitorConfig {
            interval: env_interval("SDNAGENT_JANITOR_INTERVAL", 60)?,
            grace: env_secs("SDNAGENT_JANITOR_GRACE", 300),
            prefixes: std::env::var("SDNAGENT_JANITOR_PREFIXES")
                .map(|s| InterfacePrefixes::parse(&s))
                .unwrap_or_default(),
            ..JanitorConfig::default()
        };

        Ok(Self {
            socket_path,
            host_config_path,
            servers_dir,
            switch_backend,
            log_level,
            worker,
            watch,
            janitor,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(key, default))
}

/// Like [`env_secs`] for polling periods, which must not be zero.
fn env_interval(key: &str, default: u64) -> Result<Duration> {
    interval(key, env_or(key, default))
}

fn interval(key: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        bail!("{key} must be at least one second");
    }
    Ok(Duration::from_secs(secs))
}
