//! In-memory switch for testing and dry runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sdnagent_flows::{Flow, FlowSet};
use tracing::{debug, info};

use super::{FlowSwitch, SwitchError};

#[derive(Debug, Default)]
struct MockBridge {
    ports: BTreeSet<String>,
    flows: FlowSet,
}

/// Mock switch.
///
/// Flow operations on a bridge that was never added fail with
/// [`SwitchError::NoSuchBridge`], like the real tools would.
#[derive(Debug, Default)]
pub struct MockSwitch {
    bridges: Mutex<HashMap<String, MockBridge>>,

    /// Successful mutating operations.
    mutations: AtomicU64,

    /// Flow dumps attempted.
    dumps: AtomicU64,

    /// Remaining flow operations that should fail.
    fail_next: AtomicU32,

    /// Whether every flow operation should fail.
    fail_all: AtomicBool,
}

impl MockSwitch {
    /// Create a new mock switch with no bridges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock switch with the given bridges already present.
    pub fn with_bridges<I, S>(bridges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let switch = Self::new();
        {
            let mut map = switch.lock();
            for bridge in bridges {
                map.insert(bridge.into(), MockBridge::default());
            }
        }
        switch
    }

    /// Fail the next `n` flow operations.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every flow operation until reset.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Number of successful mutating operations so far.
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of flow dumps attempted so far.
    pub fn dumps(&self) -> u64 {
        self.dumps.load(Ordering::SeqCst)
    }

    /// Current flows of a bridge, in key order.
    pub fn flows(&self, bridge: &str) -> Vec<Flow> {
        self.lock()
            .get(bridge)
            .map(|b| b.flows.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Install a flow behind the agent's back (simulates drift).
    pub fn inject_flow(&self, bridge: &str, flow: Flow) {
        if let Some(b) = self.lock().get_mut(bridge) {
            b.flows.insert(flow);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockBridge>> {
        // A panic while holding the lock only happens in a failing test.
        self.bridges.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_failure(&self, op: &str) -> Result<(), SwitchError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(SwitchError::Unavailable(format!("[MOCK] {op} failing")));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(SwitchError::Unavailable(format!("[MOCK] {op} injected failure")));
        }
        Ok(())
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FlowSwitch for MockSwitch {
    async fn add_bridge(&self, bridge: &str) -> Result<(), SwitchError> {
        info!(bridge, "[MOCK] Adding bridge");
        self.lock().entry(bridge.to_string()).or_default();
        self.mutated();
        Ok(())
    }

    async fn del_bridge(&self, bridge: &str) -> Result<(), SwitchError> {
        info!(bridge, "[MOCK] Deleting bridge");
        self.lock().remove(bridge);
        self.mutated();
        Ok(())
    }

    async fn list_ports(&self, bridge: &str) -> Result<Vec<String>, SwitchError> {
        let map = self.lock();
        let b = map
            .get(bridge)
            .ok_or_else(|| SwitchError::NoSuchBridge(bridge.to_string()))?;
        Ok(b.ports.iter().cloned().collect())
    }

    async fn add_port(&self, bridge: &str, port: &str) -> Result<(), SwitchError> {
        {
            let mut map = self.lock();
            let b = map
                .get_mut(bridge)
                .ok_or_else(|| SwitchError::NoSuchBridge(bridge.to_string()))?;
            b.ports.insert(port.to_string());
        }
        self.mutated();
        Ok(())
    }

    async fn del_port(&self, bridge: &str, port: &str) -> Result<(), SwitchError> {
        {
            let mut map = self.lock();
            if let Some(b) = map.get_mut(bridge) {
                b.ports.remove(port);
            }
        }
        self.mutated();
        Ok(())
    }

    async fn dump_flows(&self, bridge: &str) -> Result<Vec<Flow>, SwitchError> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        self.check_failure("dump-flows")?;
        let map = self.lock();
        let b = map
            .get(bridge)
            .ok_or_else(|| SwitchError::NoSuchBridge(bridge.to_string()))?;
        Ok(b.flows.iter().cloned().collect())
    }

    async fn add_flows(&self, bridge: &str, flows: &[Flow]) -> Result<(), SwitchError> {
        self.check_failure("add-flows")?;
        {
            let mut map = self.lock();
            let b = map
                .get_mut(bridge)
                .ok_or_else(|| SwitchError::NoSuchBridge(bridge.to_string()))?;
            b.flows.extend(flows.iter().cloned());
        }
        debug!(bridge, count = flows.len(), "[MOCK] Added flows");
        self.mutated();
        Ok(())
    }

    async fn del_flows(&self, bridge: &str, flows: &[Flow]) -> Result<(), SwitchError> {
        self.check_failure("del-flows")?;
        {
            let mut map = self.lock();
            let b = map
                .get_mut(bridge)
                .ok_or_else(|| SwitchError::NoSuchBridge(bridge.to_string()))?;
            for flow in flows {
                b.flows.remove(&flow.key());
            }
        }
        debug!(bridge, count = flows.len(), "[MOCK] Deleted flows");
        self.mutated();
        Ok(())
    }
}
