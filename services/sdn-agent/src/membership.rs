//! Workload membership watcher.
//!
//! Polls the workloads scheduled on this host and turns each workload's
//! NICs into anti-spoofing flows on the bridges they attach to. Bridges
//! left without any workload are retired and evicted once idle.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sdnagent_flows::Flow;
use sdnagent_networking::{validate_bridge_name, validate_ifname, MacAddr, NetworkError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::sleep_or_cancel;
use crate::error::AgentError;
use crate::supervisor::AgentSupervisor;

/// Descriptor file name inside each workload directory.
pub const DESC_FILE: &str = "desc";

const PRIORITY_ALLOW_L3: u16 = 30000;
const PRIORITY_ALLOW_L2: u16 = 20000;
const PRIORITY_DROP: u16 = 10000;

// =============================================================================
// Workloads
// =============================================================================

/// A workload scheduled on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(alias = "uuid", default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nics: Vec<WorkloadNic>,
}

/// One network attachment of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadNic {
    pub bridge: String,
    pub ifname: String,
    pub mac: MacAddr,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub vlan: Option<u16>,
}

impl Workload {
    /// Flow owner label for this workload.
    pub fn owner(&self) -> String {
        owner_for(&self.id)
    }

    pub fn bridges(&self) -> BTreeSet<&str> {
        self.nics.iter().map(|nic| nic.bridge.as_str()).collect()
    }

    pub fn validate(&self) -> Result<(), NetworkError> {
        for nic in &self.nics {
            validate_bridge_name(&nic.bridge)?;
            validate_ifname(&nic.ifname)?;
        }
        Ok(())
    }

    /// Desired flows per bridge.
    pub fn flows(&self) -> BTreeMap<String, Vec<Flow>> {
        let mut by_bridge: BTreeMap<String, Vec<Flow>> = BTreeMap::new();
        for nic in &self.nics {
            by_bridge
                .entry(nic.bridge.clone())
                .or_default()
                .extend(nic_flows(nic));
        }
        by_bridge
    }
}

pub fn owner_for(workload_id: &str) -> String {
    format!("workload/{workload_id}")
}

/// Anti-spoofing flows for one NIC.
///
/// With an address: ARP and IPv4 are allowed only from the NIC's MAC and
/// IP. Without one: any frame from the NIC's MAC. Everything else entering
/// from the port is dropped.
pub fn nic_flows(nic: &WorkloadNic) -> Vec<Flow> {
    let port = format!("in_port={}", nic.ifname);
    let mac = nic.mac;
    let allow = match nic.vlan {
        Some(vid) => format!("mod_vlan_vid:{vid},NORMAL"),
        None => "NORMAL".to_string(),
    };

    let mut flows = Vec::with_capacity(3);
    match nic.ip {
        Some(ip) => {
            flows.push(Flow::new(
                0,
                PRIORITY_ALLOW_L3,
                &format!("{port},arp,dl_src={mac},arp_sha={mac},arp_spa={ip}"),
                &allow,
            ));
            flows.push(Flow::new(
                0,
                PRIORITY_ALLOW_L3,
                &format!("{port},ip,dl_src={mac},nw_src={ip}"),
                &allow,
            ));
        }
        None => {
            flows.push(Flow::new(
                0,
                PRIORITY_ALLOW_L2,
                &format!("{port},dl_src={mac}"),
                &allow,
            ));
        }
    }
    flows.push(Flow::new(0, PRIORITY_DROP, &port, "drop"));
    flows
}

// =============================================================================
// Sources
// =============================================================================

/// Source of the workloads scheduled on this host.
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<Workload>>;
}

/// Reads `<servers_dir>/<id>/desc` JSON descriptors.
#[derive(Debug, Clone)]
pub struct DirWorkloadSource {
    servers_dir: PathBuf,
}

impl DirWorkloadSource {
    pub fn new(servers_dir: impl Into<PathBuf>) -> Self {
        Self {
            servers_dir: servers_dir.into(),
        }
    }

    async fn read_one(&self, dir_name: &str) -> Result<Workload> {
        let path = self.servers_dir.join(dir_name).join(DESC_FILE);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut workload: Workload = serde_json::from_slice(&bytes)
            .with_context(|| format!("malformed descriptor {}", path.display()))?;
        if workload.id.is_empty() {
            workload.id = dir_name.to_string();
        }
        workload.validate()?;
        Ok(workload)
    }
}

#[async_trait]
impl WorkloadSource for DirWorkloadSource {
    async fn snapshot(&self) -> Result<Vec<Workload>> {
        let mut entries = match tokio::fs::read_dir(&self.servers_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(dir = %self.servers_dir.display(), "Servers directory missing");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to list {}", self.servers_dir.display())
                })
            }
        };

        let mut workloads = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.read_one(&name).await {
                Ok(workload) => workloads.push(workload),
                Err(e) => warn!(workload = %name, error = %format!("{e:#}"), "Skipping workload"),
            }
        }

        workloads.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workloads)
    }
}

// =============================================================================
// Watcher
// =============================================================================

enum Push {
    Replace(Vec<Flow>),
    Clear,
}

/// Keeps bridge workers in line with workload membership.
pub struct MembershipWatcher {
    source: Arc<dyn WorkloadSource>,
    interval: Duration,
    applied: BTreeMap<String, Workload>,
}

impl MembershipWatcher {
    pub fn new(source: Arc<dyn WorkloadSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            applied: BTreeMap::new(),
        }
    }

    pub async fn run(mut self, supervisor: Arc<AgentSupervisor>, token: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Membership watcher started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = self.poll(&supervisor) => {
                    if let Err(e) = result {
                        warn!(error = %format!("{e:#}"), "Membership pass failed");
                    }
                }
            }

            if !sleep_or_cancel(self.interval, &token).await {
                break;
            }
        }

        info!("Membership watcher stopped");
    }

    /// Fetch a snapshot and reconcile against it.
    pub async fn poll(&mut self, supervisor: &AgentSupervisor) -> Result<()> {
        let workloads = self.source.snapshot().await?;
        self.reconcile(supervisor, workloads).await?;
        Ok(())
    }

    /// Apply one membership snapshot.
    ///
    /// A workload whose flows could not be delivered is left out of the
    /// applied state so the next pass tries it again.
    pub async fn reconcile(
        &mut self,
        supervisor: &AgentSupervisor,
        workloads: Vec<Workload>,
    ) -> Result<(), AgentError> {
        let next: BTreeMap<String, Workload> =
            workloads.into_iter().map(|w| (w.id.clone(), w)).collect();
        let mut applied = next.clone();

        for (id, old) in &self.applied {
            if next.contains_key(id) {
                continue;
            }
            info!(workload_id = %id, "Workload removed");
            for bridge in old.bridges() {
                clear_owner(supervisor, bridge, &old.owner()).await;
            }
        }

        for (id, workload) in &next {
            let previous = self.applied.get(id);
            if previous == Some(workload) {
                continue;
            }
            info!(workload_id = %id, nics = workload.nics.len(), "Workload changed");

            let owner = workload.owner();
            let mut delivered = true;
            for (bridge, flows) in workload.flows() {
                match push(supervisor, &bridge, &owner, Push::Replace(flows)).await {
                    Ok(()) => {}
                    Err(AgentError::ShuttingDown) => return Err(AgentError::ShuttingDown),
                    Err(e) => {
                        warn!(workload_id = %id, bridge = %bridge, error = %e, "Failed to push flows");
                        delivered = false;
                    }
                }
            }

            if let Some(previous) = previous {
                let current = workload.bridges();
                for bridge in previous.bridges().difference(&current) {
                    clear_owner(supervisor, bridge, &owner).await;
                }
            }

            if !delivered {
                match previous {
                    Some(previous) => applied.insert(id.clone(), previous.clone()),
                    None => applied.remove(id),
                };
            }
        }

        let before = bridges_of(&self.applied);
        let after = bridges_of(&next);
        for bridge in before.difference(&after) {
            if supervisor.retire_worker(bridge).await {
                info!(bridge = %bridge, "Bridge has no remaining workloads");
            }
        }

        self.applied = applied;
        supervisor.evict_retired().await;
        supervisor.publish_interfaces(interfaces_of(&next));
        Ok(())
    }
}

fn bridges_of(workloads: &BTreeMap<String, Workload>) -> BTreeSet<String> {
    workloads
        .values()
        .flat_map(|w| w.nics.iter().map(|nic| nic.bridge.clone()))
        .collect()
}

fn interfaces_of(workloads: &BTreeMap<String, Workload>) -> BTreeSet<String> {
    workloads
        .values()
        .flat_map(|w| w.nics.iter().map(|nic| nic.ifname.clone()))
        .collect()
}

/// Deliver to the bridge's worker, retrying once if it was evicted meanwhile.
async fn push(
    supervisor: &AgentSupervisor,
    bridge: &str,
    owner: &str,
    push: Push,
) -> Result<(), AgentError> {
    let worker = supervisor.get_or_create_worker(bridge).await?;
    let first = match &push {
        Push::Replace(flows) => worker.replace_flows(owner, flows.clone()).await,
        Push::Clear => worker.clear_flows(owner).await,
    };
    if first.is_ok() {
        return Ok(());
    }

    debug!(bridge, owner, "Worker went away, retrying with a fresh one");
    let worker = supervisor.get_or_create_worker(bridge).await?;
    match push {
        Push::Replace(flows) => worker.replace_flows(owner, flows).await?,
        Push::Clear => worker.clear_flows(owner).await?,
    }
    Ok(())
}

/// Drop `owner`'s flows from `bridge` if it has a worker.
async fn clear_owner(supervisor: &AgentSupervisor, bridge: &str, owner: &str) {
    if supervisor.workers().get(bridge).await.is_none() {
        return;
    }
    match push(supervisor, bridge, owner, Push::Clear).await {
        Ok(()) | Err(AgentError::ShuttingDown) => {}
        Err(e) => warn!(bridge, owner, error = %e, "Failed to clear flows"),
    }
}
