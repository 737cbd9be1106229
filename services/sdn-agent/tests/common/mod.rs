//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sdnagent::backoff::BackoffPolicy;
use sdnagent::config::{JanitorConfig, SwitchBackend, WatchConfig, WorkerConfig};
use sdnagent::host_config::{HostConfig, HostConfigSource};
use sdnagent::janitor::LinkManager;
use sdnagent::membership::{Workload, WorkloadNic, WorkloadSource};
use sdnagent::switch::MockSwitch;
use sdnagent::{AgentDeps, AgentSupervisor, Config};
use sdnagent_networking::InterfacePrefixes;

/// Host config whose fingerprint and auth outcome tests control.
pub struct TestHostConfig {
    pub fingerprint: Mutex<String>,
    pub reject_auth: bool,
}

impl TestHostConfig {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fingerprint: Mutex::new("v1".to_string()),
            reject_auth: false,
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            fingerprint: Mutex::new("v1".to_string()),
            reject_auth: true,
        })
    }

    pub fn change(&self) {
        *self.fingerprint.lock().unwrap() = "v2".to_string();
    }
}

#[async_trait]
impl HostConfigSource for TestHostConfig {
    async fn load(&self) -> Result<HostConfig> {
        HostConfig::parse("host_id = \"host-test\"\nzone = \"zone-a\"")
    }

    async fn authenticate(&self, _config: &HostConfig) -> Result<()> {
        if self.reject_auth {
            anyhow::bail!("401 Unauthorized");
        }
        Ok(())
    }

    async fn fingerprint(&self) -> Result<String> {
        Ok(self.fingerprint.lock().unwrap().clone())
    }
}

/// Workload set that tests replace at will.
#[derive(Default)]
pub struct TestWorkloads {
    pub workloads: Mutex<Vec<Workload>>,
}

impl TestWorkloads {
    pub fn with(workloads: Vec<Workload>) -> Arc<Self> {
        Arc::new(Self {
            workloads: Mutex::new(workloads),
        })
    }

    pub fn set(&self, workloads: Vec<Workload>) {
        *self.workloads.lock().unwrap() = workloads;
    }
}

#[async_trait]
impl WorkloadSource for TestWorkloads {
    async fn snapshot(&self) -> Result<Vec<Workload>> {
        Ok(self.workloads.lock().unwrap().clone())
    }
}

/// Host links kept in memory; deletions are recorded.
#[derive(Default)]
pub struct TestLinks {
    pub links: Mutex<BTreeSet<String>>,
    pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl LinkManager for TestLinks {
    async fn list_links(&self) -> Result<Vec<String>> {
        Ok(self.links.lock().unwrap().iter().cloned().collect())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        self.links.lock().unwrap().remove(name);
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

pub fn workload(id: &str, nics: &[(&str, &str)]) -> Workload {
    Workload {
        id: id.to_string(),
        name: format!("vm-{id}"),
        nics: nics
            .iter()
            .enumerate()
            .map(|(i, (bridge, ifname))| WorkloadNic {
                bridge: bridge.to_string(),
                ifname: ifname.to_string(),
                mac: format!("52:54:00:00:00:{:02x}", i + 1).parse().unwrap(),
                ip: None,
                vlan: None,
            })
            .collect(),
    }
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        socket_path: dir.join("run").join("sdnagent.sock"),
        host_config_path: dir.join("host.toml"),
        servers_dir: dir.join("servers"),
        switch_backend: SwitchBackend::Mock,
        log_level: "debug".to_string(),
        worker: WorkerConfig {
            mailbox_size: 16,
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(50),
                jitter: 0.0,
            },
            resync_interval: Duration::from_secs(60),
            report_threshold: 3,
        },
        watch: WatchConfig {
            membership_interval: Duration::from_millis(20),
            host_config_interval: Duration::from_millis(20),
        },
        janitor: JanitorConfig {
            interval: Duration::from_millis(20),
            jitter: 0.0,
            grace: Duration::from_secs(300),
            prefixes: InterfacePrefixes::default(),
        },
    }
}

/// A supervisor wired to in-memory collaborators.
pub struct Harness {
    pub supervisor: Arc<AgentSupervisor>,
    pub host_config: Arc<TestHostConfig>,
    pub workloads: Arc<TestWorkloads>,
    pub links: Arc<TestLinks>,
    pub switch: Arc<MockSwitch>,
    pub config: Config,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(TestHostConfig::new(), Vec::new(), |_| {})
    }

    pub fn build(
        host_config: Arc<TestHostConfig>,
        workloads: Vec<Workload>,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let workloads = TestWorkloads::with(workloads);
        let links = Arc::new(TestLinks::default());
        let switch = Arc::new(MockSwitch::with_bridges(["br0", "br1", "br2", "brA", "brB", "brC"]));

        let deps = AgentDeps {
            host_config: host_config.clone(),
            workloads: workloads.clone(),
            links: links.clone(),
            switch: switch.clone(),
        };
        let supervisor = Arc::new(AgentSupervisor::new(config.clone(), deps));

        Self {
            supervisor,
            host_config,
            workloads,
            links,
            switch,
            config,
            _dir: dir,
        }
    }

    /// Run `start` in the background.
    pub fn spawn_start(&self) -> tokio::task::JoinHandle<Result<(), sdnagent::AgentError>> {
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move { supervisor.start().await })
    }

    /// Wait until the control socket exists.
    pub async fn wait_for_socket(&self) {
        let path = self.config.socket_path.clone();
        eventually(move || path.exists()).await;
    }
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
