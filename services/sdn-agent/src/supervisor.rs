//! Agent supervisor.
//!
//! Owns the lifecycle of everything the agent runs:
//! - The per-bridge worker registry (the only place workers are created)
//! - The membership watcher, interface janitor and host config watcher
//! - The RPC server on the local control socket
//!
//! All long-running tasks hang off one cancellation token and are counted
//! by one task tracker. `stop` fires the shutdown sequence exactly once;
//! `start` returns only after every tracked task has exited.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sdnagent_networking::validate_bridge_name;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AgentError;
use crate::host_config::{HostConfigSource, HostConfigWatcher};
use crate::janitor::{InterfaceJanitor, LinkManager};
use crate::membership::{MembershipWatcher, WorkloadSource};
use crate::registry::WorkerRegistry;
use crate::rpc::{self, RpcServer};
use crate::switch::FlowSwitch;
use crate::worker::BridgeWorker;

/// Process exit code used when the control socket cannot be bound.
pub const EXIT_BIND_FAILURE: i32 = 3;

/// External collaborators of the supervisor.
#[derive(Clone)]
pub struct AgentDeps {
    pub host_config: Arc<dyn HostConfigSource>,
    pub workloads: Arc<dyn WorkloadSource>,
    pub links: Arc<dyn LinkManager>,
    pub switch: Arc<dyn FlowSwitch>,
}

/// Long-running tasks launched by `start`.
struct Watchers {
    membership: MembershipWatcher,
    janitor: InterfaceJanitor,
    host_config: HostConfigWatcher,
}

/// Supervises bridge workers and the agent's background tasks.
pub struct AgentSupervisor {
    config: Config,
    switch: Arc<dyn FlowSwitch>,
    host_config: Arc<dyn HostConfigSource>,

    lifecycle: CancellationToken,
    tracker: TaskTracker,
    stopping: AtomicBool,

    registry: WorkerRegistry,
    rpc: RpcServer,
    watchers: Mutex<Option<Watchers>>,

    /// Interface names owned by live workloads; `None` until first published.
    known_ifaces: watch::Sender<Option<BTreeSet<String>>>,
}

impl AgentSupervisor {
    pub fn new(config: Config, deps: AgentDeps) -> Self {
        let (known_ifaces, known_rx) = watch::channel(None);

        let watchers = Watchers {
            membership: MembershipWatcher::new(deps.workloads, config.watch.membership_interval),
            janitor: InterfaceJanitor::new(deps.links, config.janitor.clone(), known_rx),
            host_config: HostConfigWatcher::new(
                deps.host_config.clone(),
                config.watch.host_config_interval,
            ),
        };

        Self {
            config,
            switch: deps.switch,
            host_config: deps.host_config,
            lifecycle: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopping: AtomicBool::new(false),
            registry: WorkerRegistry::new(),
            rpc: RpcServer::new(),
            watchers: Mutex::new(Some(watchers)),
            known_ifaces,
        }
    }

    /// Run the agent until stopped.
    ///
    /// Authenticates, binds the control socket, launches the watchers and
    /// serves RPC. Returns once serving has ended and every task spawned by
    /// this supervisor has finished.
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        let watchers = self.take_watchers()?;

        let host = match self.host_config.load().await {
            Ok(host) => host,
            Err(e) => return self.abort(AgentError::HostConfig(e)).await,
        };
        if let Err(e) = self.host_config.authenticate(&host).await {
            return self.abort(AgentError::Auth(e)).await;
        }
        let baseline = match self.host_config.fingerprint().await {
            Ok(fingerprint) => fingerprint,
            Err(e) => return self.abort(AgentError::HostConfig(e)).await,
        };
        info!(host_id = %host.host_id, zone = %host.zone, "Host authenticated");

        let supervisor = Arc::clone(self);
        self.tracker.spawn(watchers.host_config.run(
            baseline,
            self.lifecycle.clone(),
            move || {
                supervisor.stop();
            },
        ));

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to bind control socket");
                return self.abort(e).await;
            }
        };
        info!(socket = %self.config.socket_path.display(), "Control socket bound");

        self.tracker.spawn(
            watchers
                .membership
                .run(Arc::clone(self), self.lifecycle.clone()),
        );
        self.tracker.spawn(watchers.janitor.run(self.lifecycle.clone()));

        let served = self.rpc.serve(listener, rpc::router(Arc::clone(self))).await;
        match &served {
            Ok(()) => info!("RPC server stopped"),
            Err(e) => error!(error = %e, "RPC server failed"),
        }

        if self.stop() {
            warn!("RPC serving ended without a stop request");
        }
        self.drain().await;

        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to remove control socket"),
        }

        info!(workers_spawned = self.workers_spawned(), "Agent stopped");
        served.map_err(AgentError::Serve)
    }

    /// Request shutdown. Safe to call any number of times from anywhere.
    ///
    /// Asks the RPC server to stop gracefully and cancels the lifecycle
    /// token. Returns true only for the call that did so. Does not wait;
    /// `start` returning is the completion signal.
    pub fn stop(&self) -> bool {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Stop already requested");
            return false;
        }

        info!("Stopping agent");
        self.rpc.graceful_stop();
        self.lifecycle.cancel();
        true
    }

    /// Return the worker for `bridge`, creating it on first use.
    pub async fn get_or_create_worker(&self, bridge: &str) -> Result<BridgeWorker, AgentError> {
        validate_bridge_name(bridge)?;

        self.registry
            .get_or_create(bridge, &self.lifecycle, |id| {
                BridgeWorker::spawn(
                    id,
                    bridge,
                    Arc::clone(&self.switch),
                    self.config.worker.clone(),
                    &self.lifecycle,
                    &self.tracker,
                )
            })
            .await
    }

    /// Mark a bridge as no longer needed by any workload.
    pub async fn retire_worker(&self, bridge: &str) -> bool {
        self.registry.retire(bridge).await
    }

    /// Evict retired workers that have drained.
    pub async fn evict_retired(&self) -> Vec<String> {
        self.registry.evict_retired().await
    }

    /// Publish the interfaces owned by live workloads to the janitor.
    pub fn publish_interfaces(&self, interfaces: BTreeSet<String>) {
        self.known_ifaces.send_replace(Some(interfaces));
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub async fn worker_count(&self) -> usize {
        self.registry.len().await
    }

    /// Workers spawned over the supervisor's lifetime.
    pub fn workers_spawned(&self) -> u64 {
        self.registry.spawned()
    }

    pub fn lifecycle(&self) -> &CancellationToken {
        &self.lifecycle
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn rpc(&self) -> &RpcServer {
        &self.rpc
    }

    pub fn switch(&self) -> &Arc<dyn FlowSwitch> {
        &self.switch
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn take_watchers(&self) -> Result<Watchers, AgentError> {
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(AgentError::AlreadyStarted)
    }

    /// Bind the control socket, replacing a stale socket file.
    fn bind(&self) -> Result<UnixListener, AgentError> {
        let path = &self.config.socket_path;
        let bind_error = |source| AgentError::Bind {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(bind_error)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(socket = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(bind_error(e)),
        }

        UnixListener::bind(path).map_err(bind_error)
    }

    /// Stop, wait for everything already launched, and fail with `err`.
    async fn abort(&self, err: AgentError) -> Result<(), AgentError> {
        self.stop();
        self.drain().await;
        Err(err)
    }

    /// Wait for every tracked task to exit. Requires the lifecycle token
    /// to be cancelled.
    async fn drain(&self) {
        // Creations that passed the cancellation check finish (and register
        // with the tracker) before this lock is granted.
        self.registry.barrier().await;
        self.tracker.close();
        self.tracker.wait().await;
        debug!("All supervised tasks finished");
    }
}
