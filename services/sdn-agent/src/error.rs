//! Supervisor-level errors.

use std::path::PathBuf;

use sdnagent_networking::NetworkError;
use thiserror::Error;

/// Errors surfaced by [`crate::AgentSupervisor`].
#[derive(Debug, Error)]
pub enum AgentError {
    /// Host configuration could not be resolved.
    #[error("host config: {0:#}")]
    HostConfig(anyhow::Error),

    /// Authentication against the control plane failed.
    #[error("auth: {0:#}")]
    Auth(anyhow::Error),

    /// The control socket could not be bound.
    #[error("listen {path} failed: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The RPC transport failed while serving.
    #[error("serve: {0}")]
    Serve(#[source] std::io::Error),

    /// The bridge identifier is not usable.
    #[error(transparent)]
    InvalidBridge(#[from] NetworkError),

    /// A bridge worker could not be reached.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// `start` was called more than once.
    #[error("agent already started")]
    AlreadyStarted,

    /// Stop has been requested; no new workers are created.
    #[error("agent is shutting down")]
    ShuttingDown,
}

/// Errors from talking to a bridge worker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker's task has exited.
    #[error("worker for bridge {0} has stopped")]
    Stopped(String),
}
