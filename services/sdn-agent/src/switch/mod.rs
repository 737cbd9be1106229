//! Virtual switch programming boundary.
//!
//! [`FlowSwitch`] abstracts the operations the agent needs from the virtual
//! switch: bridge/port management for the vswitch RPC group and flow-table
//! dump/apply for the per-bridge workers.
//!
//! - `OvsSwitch` drives Open vSwitch through its command line tools
//! - `MockSwitch` keeps everything in memory (tests and dry runs)

mod mock;
mod ovs;

use async_trait::async_trait;
use sdnagent_flows::Flow;
use thiserror::Error;

pub use mock::MockSwitch;
pub use ovs::OvsSwitch;

/// Errors from switch operations.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("no such bridge: {0}")]
    NoSuchBridge(String),

    #[error("switch unavailable: {0}")]
    Unavailable(String),

    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Virtual switch interface.
#[async_trait]
pub trait FlowSwitch: Send + Sync {
    /// Create a bridge if it does not exist.
    async fn add_bridge(&self, bridge: &str) -> Result<(), SwitchError>;

    /// Delete a bridge if it exists.
    async fn del_bridge(&self, bridge: &str) -> Result<(), SwitchError>;

    /// List the ports attached to a bridge.
    async fn list_ports(&self, bridge: &str) -> Result<Vec<String>, SwitchError>;

    /// Attach a port to a bridge (idempotent).
    async fn add_port(&self, bridge: &str, port: &str) -> Result<(), SwitchError>;

    /// Detach a port from a bridge (idempotent).
    async fn del_port(&self, bridge: &str, port: &str) -> Result<(), SwitchError>;

    /// Read the bridge's current flow table.
    async fn dump_flows(&self, bridge: &str) -> Result<Vec<Flow>, SwitchError>;

    /// Install flows, replacing flows with the same match and priority.
    async fn add_flows(&self, bridge: &str, flows: &[Flow]) -> Result<(), SwitchError>;

    /// Remove flows by strict match.
    async fn del_flows(&self, bridge: &str, flows: &[Flow]) -> Result<(), SwitchError>;
}
