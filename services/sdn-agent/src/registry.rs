//! Bridge worker registry.
//!
//! Maps bridge names to their [`BridgeWorker`]. Lookups share a read lock;
//! creation always re-checks under the write lock so concurrent first
//! access for one bridge spawns exactly one worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AgentError;
use crate::worker::BridgeWorker;

/// Registry of live bridge workers.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, BridgeWorker>>,
    spawned: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the worker for `bridge`, spawning it if absent.
    ///
    /// `spawn` receives the new worker's id and runs under the write lock,
    /// only when the entry is still missing. Creation is refused once
    /// `lifecycle` has been cancelled.
    pub async fn get_or_create<F>(
        &self,
        bridge: &str,
        lifecycle: &CancellationToken,
        spawn: F,
    ) -> Result<BridgeWorker, AgentError>
    where
        F: FnOnce(u64) -> BridgeWorker,
    {
        if let Some(worker) = self.workers.read().await.get(bridge) {
            return Ok(worker.clone());
        }

        let mut workers = self.workers.write().await;

        // Another caller may have inserted between the two locks.
        if let Some(worker) = workers.get(bridge) {
            return Ok(worker.clone());
        }

        if lifecycle.is_cancelled() {
            return Err(AgentError::ShuttingDown);
        }

        let id = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = spawn(id);
        workers.insert(bridge.to_string(), worker.clone());

        info!(bridge, worker_id = id, "Bridge worker created");
        Ok(worker)
    }

    pub async fn get(&self, bridge: &str) -> Option<BridgeWorker> {
        self.workers.read().await.get(bridge).cloned()
    }

    /// Snapshot of all workers, sorted by bridge name.
    pub async fn list(&self) -> Vec<BridgeWorker> {
        let mut workers: Vec<_> = self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.bridge().cmp(b.bridge()));
        workers
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Total workers ever spawned by this registry.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Mark `bridge` as having no dependents. Returns false if unknown.
    pub async fn retire(&self, bridge: &str) -> bool {
        match self.workers.read().await.get(bridge) {
            Some(worker) => {
                worker.retire();
                debug!(bridge, "Bridge worker retired");
                true
            }
            None => false,
        }
    }

    /// Remove retired workers with nothing left to do.
    ///
    /// A worker is claimed with [`BridgeWorker::try_evict`], which loses to
    /// any push already admitted. Each evicted worker is awaited before the
    /// write lock is released, so a replacement can never run alongside it.
    pub async fn evict_retired(&self) -> Vec<String> {
        let mut workers = self.workers.write().await;

        let evicted: Vec<String> = workers
            .iter()
            .filter(|(_, worker)| worker.try_evict())
            .map(|(bridge, _)| bridge.clone())
            .collect();

        for bridge in &evicted {
            if let Some(worker) = workers.remove(bridge) {
                worker.stopped().await;
                info!(bridge = %bridge, worker_id = worker.id(), "Bridge worker evicted");
            }
        }

        evicted
    }

    /// Wait for any creation in progress to finish.
    ///
    /// Called after the lifecycle token is cancelled: once this returns,
    /// every later creation attempt sees the cancellation.
    pub async fn barrier(&self) {
        drop(self.workers.write().await);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use sdnagent_flows::Flow;
    use tokio::sync::Barrier;
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::config::WorkerConfig;
    use crate::error::WorkerError;
    use crate::switch::{FlowSwitch, MockSwitch};
    use crate::worker::WorkerPhase;

    struct Fixture {
        registry: Arc<WorkerRegistry>,
        token: CancellationToken,
        tracker: TaskTracker,
        switch: Arc<dyn FlowSwitch>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(WorkerRegistry::new()),
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                switch: Arc::new(MockSwitch::with_bridges(["br0", "br1"])),
            }
        }

        async fn get_or_create(&self, bridge: &str) -> Result<BridgeWorker, AgentError> {
            let switch = self.switch.clone();
            let token = self.token.clone();
            let tracker = self.tracker.clone();
            self.registry
                .get_or_create(bridge, &self.token, move |id| {
                    BridgeWorker::spawn(id, bridge, switch, WorkerConfig::default(), &token, &tracker)
                })
                .await
        }

        async fn shutdown(self) {
            self.token.cancel();
            self.tracker.close();
            self.tracker.wait().await;
        }
    }

    #[tokio::test]
    async fn test_same_bridge_returns_same_worker() {
        let fx = Fixture::new();

        let a = fx.get_or_create("br0").await.unwrap();
        let b = fx.get_or_create("br0").await.unwrap();
        let c = fx.get_or_create("br1").await.unwrap();

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(fx.registry.spawned(), 2);
        assert_eq!(fx.registry.len().await, 2);

        let names: Vec<_> = fx
            .registry
            .list()
            .await
            .iter()
            .map(|w| w.bridge().to_string())
            .collect();
        assert_eq!(names, vec!["br0", "br1"]);

        fx.shutdown().await;
    }

    #[tokio::test]
    async fn test_creation_refused_after_cancel() {
        let fx = Fixture::new();
        let existing = fx.get_or_create("br0").await.unwrap();

        fx.token.cancel();
        fx.registry.barrier().await;

        let err = fx.get_or_create("br1").await.unwrap_err();
        assert!(matches!(err, AgentError::ShuttingDown));

        // existing entries are still handed out
        let again = fx.get_or_create("br0").await.unwrap();
        assert_eq!(again.id(), existing.id());

        fx.shutdown().await;
    }

    async fn wait_steady(worker: &BridgeWorker) {
        while worker.status().phase != WorkerPhase::Steady {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_acknowledged_push_survives_concurrent_eviction() {
        for _ in 0..200 {
            let fx = Fixture::new();
            let worker = fx.get_or_create("br0").await.unwrap();
            wait_steady(&worker).await;
            assert!(fx.registry.retire("br0").await);

            let barrier = Arc::new(Barrier::new(2));
            let evict = tokio::spawn({
                let registry = fx.registry.clone();
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    registry.evict_retired().await
                }
            });
            let push = tokio::spawn({
                let worker = worker.clone();
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    worker
                        .replace_flows("rpc", vec![Flow::new(0, 10, "arp", "NORMAL")])
                        .await
                }
            });

            let evicted = evict.await.unwrap();
            match push.await.unwrap() {
                Ok(()) => {
                    assert!(evicted.is_empty(), "acknowledged push lost to eviction");
                    let snapshot = worker.snapshot().await.unwrap();
                    assert!(snapshot.owners.contains_key("rpc"));
                    assert!(!worker.is_retired());
                }
                Err(e) => {
                    assert!(matches!(e, WorkerError::Stopped(_)));
                    if !evicted.is_empty() {
                        assert!(worker.is_stopped());
                        assert!(fx.registry.get("br0").await.is_none());
                    }
                }
            }

            fx.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_evict_only_retired_idle_workers() {
        let fx = Fixture::new();
        let busy = fx.get_or_create("br0").await.unwrap();
        let idle = fx.get_or_create("br1").await.unwrap();

        for worker in [&busy, &idle] {
            let mut status = worker.status();
            while status.phase != WorkerPhase::Steady {
                tokio::time::sleep(Duration::from_millis(5)).await;
                status = worker.status();
            }
        }

        assert!(fx.registry.evict_retired().await.is_empty());

        assert!(fx.registry.retire("br1").await);
        assert!(!fx.registry.retire("br9").await);

        let evicted = fx.registry.evict_retired().await;
        assert_eq!(evicted, vec!["br1".to_string()]);
        assert!(idle.is_stopped());
        assert!(!busy.is_stopped());
        assert!(fx.registry.get("br1").await.is_none());

        // a fresh worker replaces the evicted one
        let replacement = fx.get_or_create("br1").await.unwrap();
        assert_ne!(replacement.id(), idle.id());
        assert_eq!(fx.registry.spawned(), 3);

        fx.shutdown().await;
    }
}
