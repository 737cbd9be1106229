//! SDN host agent library.
//!
//! The agent runs on every hypervisor host and keeps the flow tables of the
//! host's virtual bridges in line with the workloads scheduled there.
//!
//! ## Architecture
//!
//! ```text
//! AgentSupervisor
//! ├── RpcServer            (local control socket)
//! ├── MembershipWatcher    (workloads -> per-bridge desired flows)
//! ├── InterfaceJanitor     (removes stale workload interfaces)
//! ├── HostConfigWatcher    (stops the agent when host config changes)
//! └── BridgeWorker(bridge) (one per bridge, created on first use)
//! ```
//!
//! Every task above hangs off the supervisor's lifecycle token and is
//! counted by its task tracker; `AgentSupervisor::start` returns only after
//! all of them have exited.
//!
//! ## Modules
//!
//! - `supervisor`: lifecycle, start/stop and worker creation
//! - `registry`: bridge -> worker map with exactly-once creation
//! - `worker`: per-bridge flow synchronization
//! - `membership`, `janitor`, `host_config`: background watchers
//! - `switch`: virtual switch programming (OVS and in-memory)
//! - `rpc`: HTTP/JSON surface on the control socket

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod host_config;
pub mod janitor;
pub mod membership;
pub mod registry;
pub mod rpc;
pub mod supervisor;
pub mod switch;
pub mod worker;

pub use config::Config;
pub use error::{AgentError, WorkerError};
pub use supervisor::{AgentDeps, AgentSupervisor, EXIT_BIND_FAILURE};
pub use worker::{BridgeWorker, WorkerPhase, WorkerStatus};
