//! RPC surface served on the local control socket.
//!
//! Three groups of routes, all sharing the supervisor as state:
//! - `/v1/vswitch`: bridges and ports
//! - `/v1/openflow`: per-owner flow tables
//! - `/v1/reflection`: what this surface offers

pub mod error;
mod openflow;
mod reflection;
mod vswitch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::supervisor::AgentSupervisor;

pub use error::ApiError;
pub use reflection::{ServiceDescriptor, SERVICES};

/// Shared handler state.
pub type RpcState = Arc<AgentSupervisor>;

/// Build the RPC router.
pub fn router(supervisor: RpcState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1/vswitch", vswitch::routes())
        .nest("/v1/openflow", openflow::routes())
        .route("/v1/reflection", get(reflection::list_services))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Serves the router until asked to stop.
#[derive(Debug, Default)]
pub struct RpcServer {
    shutdown: CancellationToken,
    stop_requests: AtomicU64,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve until [`RpcServer::graceful_stop`] is called. In-flight
    /// requests are allowed to finish; new connections are refused.
    pub async fn serve(&self, listener: UnixListener, router: Router) -> std::io::Result<()> {
        axum::serve(listener, router)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await
    }

    pub fn graceful_stop(&self) {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        info!("RPC server stopping gracefully");
        self.shutdown.cancel();
    }

    /// How many times a graceful stop was requested.
    pub fn stop_requests(&self) -> u64 {
        self.stop_requests.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    workers: usize,
    workers_spawned: u64,
}

async fn healthz(State(supervisor): State<RpcState>) -> Json<HealthResponse> {
    let status = if supervisor.is_stopping() {
        "stopping"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        workers: supervisor.worker_count().await,
        workers_spawned: supervisor.workers_spawned(),
    })
}
