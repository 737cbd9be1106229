//! Bridge worker - keeps one bridge's flow table in sync with desired state.
//!
//! Each bridge known to the agent has exactly one worker. The worker:
//! - Owns the desired flows for its bridge, grouped by owner (a workload or
//!   an RPC client)
//! - Processes messages sequentially and coalesces bursts into one sync pass
//! - Retries failed passes with capped exponential backoff, forever
//! - Exits only when its cancellation token fires
//!
//! ## State Machine
//!
//! ```text
//! starting -> syncing <-> steady
//!                |           |
//!                +-> stopping -> stopped     (cancellation only)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sdnagent_flows::{Flow, FlowSet};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::switch::{FlowSwitch, SwitchError};

// =============================================================================
// Messages and status
// =============================================================================

/// Messages handled by a bridge worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Replace everything `owner` wants on this bridge.
    ReplaceFlows { owner: String, flows: Vec<Flow> },

    /// Add to `owner`'s flows.
    AddFlows { owner: String, flows: Vec<Flow> },

    /// Remove some of `owner`'s flows.
    DelFlows { owner: String, flows: Vec<Flow> },

    /// Drop every flow of `owner`.
    ClearFlows { owner: String },

    /// Re-verify the switch now.
    Resync,

    /// Report desired state and status.
    Snapshot { reply: oneshot::Sender<WorkerSnapshot> },
}

/// Lifecycle phase of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Starting,
    /// Applying desired flows (also while retrying after failures).
    Syncing,
    /// Switch matches desired state; waiting for changes.
    Steady,
    Stopping,
    Stopped,
}

/// Observable worker status.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    pub desired_flows: usize,
    pub consecutive_failures: u32,
    /// Set once failures reach the report threshold; cleared on success.
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            phase: WorkerPhase::Starting,
            desired_flows: 0,
            consecutive_failures: 0,
            degraded: false,
            last_error: None,
            last_synced_at: None,
        }
    }
}

/// Point-in-time view of a worker's desired state.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub bridge: String,
    pub owners: BTreeMap<String, Vec<Flow>>,
    pub status: WorkerStatus,
}

// =============================================================================
// Handle
// =============================================================================

// Registry state of a worker, stored in `Shared::state`.
const ACTIVE: u8 = 0;
const RETIRED: u8 = 1;
/// Held only by the registry while it decides on eviction. Senders are
/// refused in this state.
const EVICTING: u8 = 2;

struct Shared {
    id: u64,
    bridge: String,
    state: AtomicU8,
    /// Messages admitted by a sender and not yet handled by the worker.
    pending: Arc<AtomicUsize>,
    status: watch::Receiver<WorkerStatus>,
    cancel: CancellationToken,
}

/// Handle to a running bridge worker. Cheap to clone.
#[derive(Clone)]
pub struct BridgeWorker {
    shared: Arc<Shared>,
    tx: mpsc::Sender<WorkerMessage>,
}

impl fmt::Debug for BridgeWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeWorker")
            .field("id", &self.shared.id)
            .field("bridge", &self.shared.bridge)
            .field("phase", &self.shared.status.borrow().phase)
            .finish()
    }
}

impl BridgeWorker {
    /// Spawn a worker for `bridge` on `tracker`.
    ///
    /// The worker's token is a child of `parent`, so cancelling the parent
    /// stops it.
    pub fn spawn(
        id: u64,
        bridge: &str,
        switch: Arc<dyn FlowSwitch>,
        config: WorkerConfig,
        parent: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let cancel = parent.child_token();
        let (tx, rx) = mpsc::channel(config.mailbox_size.max(1));
        let (status_tx, status_rx) = watch::channel(WorkerStatus::default());
        let pending = Arc::new(AtomicUsize::new(0));

        let runner = WorkerRunner {
            id,
            bridge: bridge.to_string(),
            switch,
            config,
            rx,
            status: status_tx,
            cancel: cancel.clone(),
            pending: pending.clone(),
            owners: BTreeMap::new(),
        };
        tracker.spawn(runner.run());

        Self {
            shared: Arc::new(Shared {
                id,
                bridge: bridge.to_string(),
                state: AtomicU8::new(ACTIVE),
                pending,
                status: status_rx,
                cancel,
            }),
            tx,
        }
    }

    /// Worker id, unique within one supervisor.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn bridge(&self) -> &str {
        &self.shared.bridge
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.status.borrow().phase == WorkerPhase::Stopped
    }

    /// Wait until the worker has stopped.
    pub async fn stopped(&self) {
        let mut rx = self.shared.status.clone();
        // Err means the task is gone, which is just as stopped.
        let _ = rx.wait_for(|s| s.phase == WorkerPhase::Stopped).await;
    }

    pub async fn replace_flows(
        &self,
        owner: impl Into<String>,
        flows: Vec<Flow>,
    ) -> Result<(), WorkerError> {
        self.send(
            WorkerMessage::ReplaceFlows {
                owner: owner.into(),
                flows,
            },
            true,
        )
        .await
    }

    pub async fn add_flows(
        &self,
        owner: impl Into<String>,
        flows: Vec<Flow>,
    ) -> Result<(), WorkerError> {
        self.send(
            WorkerMessage::AddFlows {
                owner: owner.into(),
                flows,
            },
            true,
        )
        .await
    }

    pub async fn del_flows(
        &self,
        owner: impl Into<String>,
        flows: Vec<Flow>,
    ) -> Result<(), WorkerError> {
        self.send(
            WorkerMessage::DelFlows {
                owner: owner.into(),
                flows,
            },
            false,
        )
        .await
    }

    pub async fn clear_flows(&self, owner: impl Into<String>) -> Result<(), WorkerError> {
        self.send(
            WorkerMessage::ClearFlows {
                owner: owner.into(),
            },
            false,
        )
        .await
    }

    pub async fn resync(&self) -> Result<(), WorkerError> {
        self.send(WorkerMessage::Resync, false).await
    }

    pub async fn snapshot(&self) -> Result<WorkerSnapshot, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerMessage::Snapshot { reply }, false).await?;
        rx.await.map_err(|_| self.stopped_error())
    }

    /// Queue `msg`, bringing a retired worker back into use if `revive`.
    ///
    /// The message is counted as pending before the registry state is
    /// checked, so an eviction decided after this point sees it.
    async fn send(&self, msg: WorkerMessage, revive: bool) -> Result<(), WorkerError> {
        let pending = &self.shared.pending;
        pending.fetch_add(1, Ordering::SeqCst);

        let admitted = if revive {
            self.unretire()
        } else {
            self.shared.state.load(Ordering::SeqCst) != EVICTING
        };
        if !admitted {
            pending.fetch_sub(1, Ordering::SeqCst);
            return Err(self.stopped_error());
        }

        self.tx.send(msg).await.map_err(|_| {
            pending.fetch_sub(1, Ordering::SeqCst);
            self.stopped_error()
        })
    }

    fn stopped_error(&self) -> WorkerError {
        WorkerError::Stopped(self.shared.bridge.clone())
    }

    // -------------------------------------------------------------------------
    // Registry bookkeeping
    // -------------------------------------------------------------------------

    /// Mark the bridge as having no remaining dependents.
    pub fn retire(&self) {
        let _ = self.shared.state.compare_exchange(
            ACTIVE,
            RETIRED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Bring a retired worker back into use.
    ///
    /// Returns false if the worker is being evicted; it must not be used
    /// any more.
    pub fn unretire(&self) -> bool {
        match self.shared.state.compare_exchange(
            RETIRED,
            ACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(state) => state == ACTIVE,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) != ACTIVE
    }

    /// Retired, idle, nothing desired and nothing pending.
    pub fn is_evictable(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == RETIRED && self.is_idle()
    }

    fn is_idle(&self) -> bool {
        if self.shared.pending.load(Ordering::SeqCst) != 0 {
            return false;
        }
        let status = self.shared.status.borrow();
        status.phase == WorkerPhase::Steady && status.desired_flows == 0
    }

    /// Claim a retired, idle worker for eviction and cancel it.
    ///
    /// Once this returns true every later send fails with
    /// [`WorkerError::Stopped`]; a send admitted before the claim keeps the
    /// worker alive instead.
    pub fn try_evict(&self) -> bool {
        let state = &self.shared.state;
        if state
            .compare_exchange(RETIRED, EVICTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        if !self.is_idle() {
            let _ = state.compare_exchange(EVICTING, RETIRED, Ordering::SeqCst, Ordering::SeqCst);
            return false;
        }

        self.cancel();
        true
    }

    /// Cancel this worker only.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }
}

// =============================================================================
// Worker loop
// =============================================================================

struct WorkerRunner {
    id: u64,
    bridge: String,
    switch: Arc<dyn FlowSwitch>,
    config: WorkerConfig,
    rx: mpsc::Receiver<WorkerMessage>,
    status: watch::Sender<WorkerStatus>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
    owners: BTreeMap<String, FlowSet>,
}

/// Outcome of waiting for the next event.
enum Wake {
    Changed,
    Cancelled,
}

impl WorkerRunner {
    async fn run(mut self) {
        info!(bridge = %self.bridge, worker_id = self.id, "Bridge worker started");

        let mut attempt = 0u32;

        loop {
            self.set_phase(WorkerPhase::Syncing);

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.sync_once() => result,
            };

            let wake = match result {
                Ok(()) => {
                    attempt = 0;
                    self.record_success();
                    self.wait_steady().await
                }
                Err(e) => {
                    self.record_failure(&e);
                    let delay = self.config.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    debug!(
                        bridge = %self.bridge,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying flow sync after backoff"
                    );
                    self.wait_backoff(delay).await
                }
            };

            if let Wake::Cancelled = wake {
                break;
            }
        }

        self.set_phase(WorkerPhase::Stopping);
        self.rx.close();
        self.set_phase(WorkerPhase::Stopped);

        info!(bridge = %self.bridge, worker_id = self.id, "Bridge worker stopped");
    }

    /// Wait in steady state for a change, a resync tick or cancellation.
    async fn wait_steady(&mut self) -> Wake {
        let resync = tokio::time::sleep(self.config.resync_interval);
        tokio::pin!(resync);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Wake::Cancelled,
                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        // Every handle is gone; nobody can reach us any more.
                        return Wake::Cancelled;
                    };
                    let mut changed = self.handle(msg);
                    while let Ok(msg) = self.rx.try_recv() {
                        changed |= self.handle(msg);
                    }
                    if changed {
                        return Wake::Changed;
                    }
                }
                _ = &mut resync => {
                    debug!(bridge = %self.bridge, "Periodic flow resync");
                    return Wake::Changed;
                }
            }
        }
    }

    /// Sleep out a retry delay, still applying incoming messages.
    async fn wait_backoff(&mut self, delay: std::time::Duration) -> Wake {
        let deadline = Instant::now() + delay;
        let mut mailbox_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return Wake::Changed,
                msg = self.rx.recv(), if mailbox_open => match msg {
                    Some(msg) => {
                        self.handle(msg);
                    }
                    None => mailbox_open = false,
                },
            }
        }
    }

    /// Apply a message. Returns true when a sync pass is needed.
    fn handle(&mut self, msg: WorkerMessage) -> bool {
        let changed = match msg {
            WorkerMessage::ReplaceFlows { owner, flows } => {
                if flows.is_empty() {
                    self.owners.remove(&owner);
                } else {
                    self.owners.insert(owner, flows.into_iter().collect());
                }
                true
            }
            WorkerMessage::AddFlows { owner, flows } => {
                if !flows.is_empty() {
                    self.owners.entry(owner).or_default().extend(flows);
                }
                true
            }
            WorkerMessage::DelFlows { owner, flows } => {
                if let Some(set) = self.owners.get_mut(&owner) {
                    for flow in &flows {
                        set.remove(&flow.key());
                    }
                    if set.is_empty() {
                        self.owners.remove(&owner);
                    }
                }
                true
            }
            WorkerMessage::ClearFlows { owner } => self.owners.remove(&owner).is_some(),
            WorkerMessage::Resync => true,
            WorkerMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                false
            }
        };

        if changed {
            // Pending work: report Syncing until the next pass completes.
            let desired = self.desired().len();
            self.status.send_modify(|s| {
                s.desired_flows = desired;
                s.phase = WorkerPhase::Syncing;
            });
        }
        // Only after the status reflects the message.
        self.pending.fetch_sub(1, Ordering::SeqCst);
        changed
    }

    /// Union of every owner's flows.
    fn desired(&self) -> FlowSet {
        let mut desired = FlowSet::new();
        for (owner, flows) in &self.owners {
            for flow in flows.iter() {
                if let Some(previous) = desired.insert(flow.clone()) {
                    if previous.actions != flow.actions {
                        debug!(
                            bridge = %self.bridge,
                            owner = %owner,
                            flow = %flow,
                            "Conflicting flow from another owner replaced"
                        );
                    }
                }
            }
        }
        desired
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            bridge: self.bridge.clone(),
            owners: self
                .owners
                .iter()
                .map(|(owner, flows)| (owner.clone(), flows.iter().cloned().collect()))
                .collect(),
            status: self.status.borrow().clone(),
        }
    }

    /// One pass: dump, diff, delete stale, add missing.
    async fn sync_once(&self) -> Result<(), SwitchError> {
        let actual: FlowSet = self.switch.dump_flows(&self.bridge).await?.into_iter().collect();
        let diff = self.desired().diff(&actual);

        if diff.is_empty() {
            debug!(bridge = %self.bridge, "Flows already converged");
            return Ok(());
        }

        if !diff.to_delete.is_empty() {
            self.switch.del_flows(&self.bridge, &diff.to_delete).await?;
        }
        if !diff.to_add.is_empty() {
            self.switch.add_flows(&self.bridge, &diff.to_add).await?;
        }

        info!(
            bridge = %self.bridge,
            added = diff.to_add.len(),
            deleted = diff.to_delete.len(),
            "Flows synchronized"
        );
        Ok(())
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    fn record_success(&self) {
        let was_degraded = self.status.borrow().degraded;
        if was_degraded {
            info!(bridge = %self.bridge, "Bridge flow sync recovered");
        }
        self.status.send_modify(|s| {
            s.phase = WorkerPhase::Steady;
            s.consecutive_failures = 0;
            s.degraded = false;
            s.last_error = None;
            s.last_synced_at = Some(Utc::now());
        });
    }

    fn record_failure(&self, err: &SwitchError) {
        let threshold = self.config.report_threshold.max(1);
        let mut failures = 0;
        self.status.send_modify(|s| {
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            s.last_error = Some(err.to_string());
            if s.consecutive_failures >= threshold {
                s.degraded = true;
            }
            failures = s.consecutive_failures;
        });

        if failures < threshold {
            warn!(bridge = %self.bridge, error = %err, failures, "Flow sync failed");
        } else if failures == threshold {
            error!(
                bridge = %self.bridge,
                error = %err,
                failures,
                "Flow sync failing repeatedly, bridge degraded"
            );
        } else {
            debug!(bridge = %self.bridge, error = %err, failures, "Flow sync still failing");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::switch::MockSwitch;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            mailbox_size: 16,
            backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(20),
                jitter: 0.0,
            },
            resync_interval: Duration::from_secs(60),
            report_threshold: 3,
        }
    }

    fn spawn_worker(
        switch: Arc<MockSwitch>,
        config: WorkerConfig,
    ) -> (BridgeWorker, CancellationToken, TaskTracker) {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let worker = BridgeWorker::spawn(1, "br0", switch, config, &token, &tracker);
        (worker, token, tracker)
    }

    async fn wait_for_phase(worker: &BridgeWorker, phase: WorkerPhase) {
        let mut rx = worker.shared.status.clone();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("timed out waiting for phase")
            .expect("status channel closed");
    }

    #[tokio::test]
    async fn test_worker_applies_flows() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        let (worker, token, tracker) = spawn_worker(switch.clone(), fast_config());

        let flows = vec![
            Flow::new(0, 100, "in_port=vnet0", "NORMAL"),
            Flow::new(0, 90, "in_port=vnet0", "drop"),
        ];
        worker.replace_flows("workload/a", flows.clone()).await.unwrap();

        // the snapshot is answered after the replace was handled
        let snapshot = worker.snapshot().await.unwrap();
        assert_eq!(snapshot.owners["workload/a"].len(), 2);

        wait_for_phase(&worker, WorkerPhase::Steady).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while switch.flows("br0").len() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(worker.is_stopped());
    }

    #[tokio::test]
    async fn test_worker_removes_stale_agent_flows_only() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        switch.inject_flow("br0", Flow::new(0, 100, "in_port=gone", "NORMAL"));
        switch.inject_flow("br0", Flow::new(0, 0, "", "NORMAL").with_cookie(0));

        let (worker, token, _tracker) = spawn_worker(switch.clone(), fast_config());
        wait_for_phase(&worker, WorkerPhase::Steady).await;

        let remaining = switch.flows("br0");
        assert_eq!(remaining.len(), 1);
        assert!(!remaining[0].is_agent_owned());

        token.cancel();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn test_worker_retries_then_recovers() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        switch.fail_next(4);

        let (worker, token, _tracker) = spawn_worker(switch.clone(), fast_config());
        worker
            .replace_flows("rpc", vec![Flow::new(0, 10, "arp", "NORMAL")])
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let status = worker.status();
                if status.phase == WorkerPhase::Steady && switch.flows("br0").len() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker never recovered");

        let status = worker.status();
        assert_eq!(status.consecutive_failures, 0);
        assert!(!status.degraded);
        assert!(status.last_synced_at.is_some());

        token.cancel();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn test_worker_degrades_but_keeps_running() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        switch.set_failing(true);

        let (worker, token, _tracker) = spawn_worker(switch.clone(), fast_config());

        let mut rx = worker.shared.status.clone();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.degraded))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(worker.status().phase, WorkerPhase::Syncing);
        assert!(!worker.is_stopped());

        switch.set_failing(false);
        wait_for_phase(&worker, WorkerPhase::Steady).await;
        assert!(!worker.status().degraded);

        token.cancel();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        switch.set_failing(true);

        let mut config = fast_config();
        config.backoff = BackoffPolicy {
            base: Duration::from_secs(3600),
            max: Duration::from_secs(3600),
            jitter: 0.0,
        };
        let (worker, token, tracker) = spawn_worker(switch.clone(), config);

        let mut rx = worker.shared.status.clone();
        rx.wait_for(|s| s.consecutive_failures >= 1).await.unwrap();

        let cancelled_at = std::time::Instant::now();
        token.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_millis(500), tracker.wait())
            .await
            .expect("worker did not observe cancellation during backoff");
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
        assert!(worker.is_stopped());
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        let (worker, token, _tracker) = spawn_worker(switch, fast_config());

        token.cancel();
        worker.stopped().await;

        assert_eq!(
            worker.resync().await,
            Err(WorkerError::Stopped("br0".to_string()))
        );
    }

    #[tokio::test]
    async fn test_owners_are_independent() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        let (worker, token, _tracker) = spawn_worker(switch.clone(), fast_config());

        worker
            .replace_flows("a", vec![Flow::new(0, 10, "in_port=a", "NORMAL")])
            .await
            .unwrap();
        worker
            .add_flows("b", vec![Flow::new(0, 10, "in_port=b", "NORMAL")])
            .await
            .unwrap();
        worker.clear_flows("a").await.unwrap();

        let snapshot = worker.snapshot().await.unwrap();
        assert_eq!(snapshot.owners.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(snapshot.status.desired_flows, 1);

        token.cancel();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn test_retire_and_evictable() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        let (worker, token, _tracker) = spawn_worker(switch, fast_config());
        wait_for_phase(&worker, WorkerPhase::Steady).await;

        assert!(!worker.is_evictable());
        worker.retire();
        assert!(worker.is_evictable());

        // pushing desired state brings the bridge back into use
        worker
            .replace_flows("a", vec![Flow::new(0, 10, "arp", "NORMAL")])
            .await
            .unwrap();
        assert!(!worker.is_retired());

        token.cancel();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn test_eviction_refuses_later_sends() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        let (worker, _token, _tracker) = spawn_worker(switch, fast_config());
        wait_for_phase(&worker, WorkerPhase::Steady).await;

        // only retired workers can be claimed
        assert!(!worker.try_evict());
        worker.retire();
        assert!(worker.try_evict());
        worker.stopped().await;

        let stopped = Err(WorkerError::Stopped("br0".to_string()));
        assert_eq!(
            worker.replace_flows("a", vec![Flow::new(0, 10, "arp", "NORMAL")]).await,
            stopped
        );
        assert_eq!(worker.resync().await, stopped);
        assert!(!worker.unretire());
    }

    #[tokio::test]
    async fn test_pending_message_blocks_eviction() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        let (worker, token, _tracker) = spawn_worker(switch, fast_config());
        wait_for_phase(&worker, WorkerPhase::Steady).await;
        worker.retire();

        // a sender admitted but not yet handled
        worker.shared.pending.fetch_add(1, Ordering::SeqCst);
        assert!(!worker.is_evictable());
        assert!(!worker.try_evict());
        assert!(worker.is_retired());
        assert!(!worker.is_stopped());

        worker.shared.pending.fetch_sub(1, Ordering::SeqCst);
        assert!(worker.is_evictable());

        token.cancel();
        worker.stopped().await;
    }

    #[tokio::test]
    async fn test_handled_messages_clear_pending() {
        let switch = Arc::new(MockSwitch::with_bridges(["br0"]));
        let (worker, token, _tracker) = spawn_worker(switch, fast_config());

        worker
            .replace_flows("a", vec![Flow::new(0, 10, "arp", "NORMAL")])
            .await
            .unwrap();
        worker.clear_flows("a").await.unwrap();
        worker.resync().await.unwrap();
        worker.snapshot().await.unwrap();

        assert_eq!(worker.shared.pending.load(Ordering::SeqCst), 0);

        token.cancel();
        worker.stopped().await;
    }
}
