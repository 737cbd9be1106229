//! Membership watcher driving bridge workers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use sdnagent::membership::{owner_for, MembershipWatcher};
use sdnagent::WorkerPhase;
use sdnagent_flows::Flow;
use tokio::sync::Barrier;

use common::{eventually, workload, Harness, TestLinks};

fn watcher(h: &Harness) -> MembershipWatcher {
    MembershipWatcher::new(h.workloads.clone(), Duration::from_secs(60))
}

async fn settled(h: &Harness, bridge: &str) -> sdnagent::WorkerStatus {
    let worker = h.supervisor.workers().get(bridge).await.expect("worker exists");
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            // a snapshot round-trip guarantees earlier messages were handled
            let snapshot = worker.snapshot().await.unwrap();
            if snapshot.status.phase == WorkerPhase::Steady {
                return snapshot.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker never settled")
}

#[tokio::test]
async fn test_workloads_create_workers_and_flows() {
    let h = Harness::new();
    let mut watcher = watcher(&h);

    h.workloads.set(vec![
        workload("w1", &[("br0", "vnet0"), ("br1", "vnet1")]),
        workload("w2", &[("br0", "vnet2")]),
    ]);
    watcher.poll(&h.supervisor).await.unwrap();

    assert_eq!(h.supervisor.workers_spawned(), 2);
    settled(&h, "br0").await;
    settled(&h, "br1").await;

    // two flows (allow + drop) per NIC
    assert_eq!(h.switch.flows("br0").len(), 4);
    assert_eq!(h.switch.flows("br1").len(), 2);

    let snapshot = h.supervisor.workers().get("br0").await.unwrap().snapshot().await.unwrap();
    let owners: Vec<_> = snapshot.owners.keys().cloned().collect();
    assert_eq!(owners, vec![owner_for("w1"), owner_for("w2")]);

    h.supervisor.stop();
}

#[tokio::test]
async fn test_unchanged_snapshot_is_a_no_op() {
    let h = Harness::new();
    let mut watcher = watcher(&h);

    h.workloads.set(vec![workload("w1", &[("br0", "vnet0")])]);
    watcher.poll(&h.supervisor).await.unwrap();
    settled(&h, "br0").await;
    let mutations = h.switch.mutations();

    watcher.poll(&h.supervisor).await.unwrap();
    settled(&h, "br0").await;
    assert_eq!(h.switch.mutations(), mutations);

    h.supervisor.stop();
}

#[tokio::test]
async fn test_removed_bridge_is_retired_then_evicted() {
    let h = Harness::new();
    let mut watcher = watcher(&h);

    h.workloads.set(vec![workload("w1", &[("br0", "vnet0"), ("br1", "vnet1")])]);
    watcher.poll(&h.supervisor).await.unwrap();
    let old = h.supervisor.workers().get("br1").await.unwrap();
    settled(&h, "br1").await;

    // w1 leaves br1; a failing switch keeps the worker busy with the clear
    h.switch.set_failing(true);
    h.workloads.set(vec![workload("w1", &[("br0", "vnet0")])]);
    watcher.poll(&h.supervisor).await.unwrap();

    assert!(old.is_retired());
    let still = h.supervisor.workers().get("br1").await.expect("busy worker kept");
    assert_eq!(still.id(), old.id());
    assert!(!old.is_stopped());

    h.switch.set_failing(false);
    let status = settled(&h, "br1").await;
    assert_eq!(status.desired_flows, 0);
    watcher.poll(&h.supervisor).await.unwrap();

    assert!(h.supervisor.workers().get("br1").await.is_none());
    assert!(old.is_stopped());
    assert!(h.switch.flows("br1").is_empty());
    assert!(h.supervisor.workers().get("br0").await.is_some());

    // coming back gets a fresh worker
    h.workloads.set(vec![workload("w1", &[("br0", "vnet0"), ("br1", "vnet1")])]);
    watcher.poll(&h.supervisor).await.unwrap();
    let fresh = h.supervisor.workers().get("br1").await.unwrap();
    assert_ne!(fresh.id(), old.id());

    h.supervisor.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acknowledged_push_is_never_lost_to_eviction() {
    let h = Harness::new();
    let flow = Flow::new(0, 10, "arp", "NORMAL");

    for _ in 0..100 {
        let worker = h.supervisor.get_or_create_worker("br2").await.unwrap();
        worker.clear_flows("rpc").await.unwrap();
        settled(&h, "br2").await;
        assert!(h.supervisor.retire_worker("br2").await);

        let barrier = Arc::new(Barrier::new(2));
        let evict = tokio::spawn({
            let supervisor = h.supervisor.clone();
            let barrier = barrier.clone();
            async move {
                barrier.wait().await;
                supervisor.evict_retired().await
            }
        });
        let push = tokio::spawn({
            let worker = worker.clone();
            let flows = vec![flow.clone()];
            let barrier = barrier.clone();
            async move {
                barrier.wait().await;
                worker.replace_flows("rpc", flows).await
            }
        });

        let evicted = evict.await.unwrap();
        if push.await.unwrap().is_ok() {
            assert!(evicted.is_empty());
            let current = h.supervisor.workers().get("br2").await.expect("worker kept");
            assert_eq!(current.id(), worker.id());
            let switch = h.switch.clone();
            eventually(move || switch.flows("br2").len() == 1).await;
        }
    }

    h.supervisor.stop();
}

#[tokio::test]
async fn test_shared_bridge_survives_partial_removal() {
    let h = Harness::new();
    let mut watcher = watcher(&h);

    h.workloads.set(vec![
        workload("w1", &[("br0", "vnet0")]),
        workload("w2", &[("br0", "vnet1")]),
    ]);
    watcher.poll(&h.supervisor).await.unwrap();

    h.workloads.set(vec![workload("w2", &[("br0", "vnet1")])]);
    watcher.poll(&h.supervisor).await.unwrap();

    let worker = h.supervisor.workers().get("br0").await.unwrap();
    assert!(!worker.is_retired());
    let status = settled(&h, "br0").await;
    assert_eq!(status.desired_flows, 2);

    h.supervisor.stop();
}

#[tokio::test]
async fn test_pass_refused_while_shutting_down() {
    let h = Harness::new();
    let mut watcher = watcher(&h);

    h.workloads.set(vec![workload("w1", &[("br0", "vnet0")])]);
    h.supervisor.stop();

    // refused while shutting down; nothing recorded as applied
    assert!(watcher.poll(&h.supervisor).await.is_err());
    assert_eq!(h.supervisor.workers_spawned(), 0);
}

#[tokio::test]
async fn test_janitor_follows_membership() {
    let h = Harness::build(common::TestHostConfig::new(), Vec::new(), |config| {
        config.janitor.grace = Duration::ZERO;
    });
    h.links.links.lock().unwrap().extend(
        ["eth0", "vnet0", "vnet9"].iter().map(|s| s.to_string()),
    );
    h.workloads.set(vec![workload("w1", &[("br0", "vnet0")])]);

    let start = h.spawn_start();
    let links: Arc<TestLinks> = h.links.clone();
    eventually(|| links.deleted.lock().unwrap().contains(&"vnet9".to_string())).await;

    h.supervisor.stop();
    start.await.unwrap().unwrap();

    let remaining: Vec<_> = h.links.links.lock().unwrap().iter().cloned().collect();
    assert_eq!(remaining, vec!["eth0", "vnet0"]);
    assert_eq!(*h.links.deleted.lock().unwrap(), vec!["vnet9".to_string()]);
}
