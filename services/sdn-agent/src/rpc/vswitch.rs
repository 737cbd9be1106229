//! Bridge and port management.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use sdnagent_networking::{validate_bridge_name, validate_ifname};
use serde::Serialize;
use tracing::info;

use super::{ApiError, RpcState};
use crate::worker::{BridgeWorker, WorkerStatus};

pub fn routes() -> Router<RpcState> {
    Router::new()
        .route("/bridges", get(list_bridges))
        .route("/bridges/{bridge}", put(ensure_bridge).delete(delete_bridge))
        .route("/bridges/{bridge}/ports", get(list_ports))
        .route(
            "/bridges/{bridge}/ports/{port}",
            put(add_port).delete(delete_port),
        )
}

#[derive(Debug, Serialize)]
pub struct BridgeInfo {
    pub bridge: String,
    pub worker_id: u64,
    pub retired: bool,
    pub status: WorkerStatus,
}

impl From<&BridgeWorker> for BridgeInfo {
    fn from(worker: &BridgeWorker) -> Self {
        Self {
            bridge: worker.bridge().to_string(),
            worker_id: worker.id(),
            retired: worker.is_retired(),
            status: worker.status(),
        }
    }
}

async fn list_bridges(State(supervisor): State<RpcState>) -> Json<Vec<BridgeInfo>> {
    let workers = supervisor.workers().list().await;
    Json(workers.iter().map(BridgeInfo::from).collect())
}

/// Create the bridge on the switch and make sure it has a worker.
async fn ensure_bridge(
    State(supervisor): State<RpcState>,
    Path(bridge): Path<String>,
) -> Result<Json<BridgeInfo>, ApiError> {
    validate_bridge_name(&bridge)?;
    supervisor.switch().add_bridge(&bridge).await?;
    let worker = supervisor.get_or_create_worker(&bridge).await?;
    info!(bridge = %bridge, "Bridge ensured via RPC");
    Ok(Json(BridgeInfo::from(&worker)))
}

/// Delete the bridge from the switch and retire its worker.
async fn delete_bridge(
    State(supervisor): State<RpcState>,
    Path(bridge): Path<String>,
) -> Result<StatusCode, ApiError> {
    validate_bridge_name(&bridge)?;
    supervisor.switch().del_bridge(&bridge).await?;
    if supervisor.retire_worker(&bridge).await {
        supervisor.evict_retired().await;
    }
    info!(bridge = %bridge, "Bridge deleted via RPC");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_ports(
    State(supervisor): State<RpcState>,
    Path(bridge): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    validate_bridge_name(&bridge)?;
    Ok(Json(supervisor.switch().list_ports(&bridge).await?))
}

async fn add_port(
    State(supervisor): State<RpcState>,
    Path((bridge, port)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    validate_bridge_name(&bridge)?;
    validate_ifname(&port)?;
    supervisor.switch().add_port(&bridge, &port).await?;
    resync(&supervisor, &bridge).await?;
    info!(bridge = %bridge, port = %port, "Port added via RPC");
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_port(
    State(supervisor): State<RpcState>,
    Path((bridge, port)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    validate_bridge_name(&bridge)?;
    validate_ifname(&port)?;
    supervisor.switch().del_port(&bridge, &port).await?;
    resync(&supervisor, &bridge).await?;
    info!(bridge = %bridge, port = %port, "Port deleted via RPC");
    Ok(StatusCode::NO_CONTENT)
}

/// Port numbers change with ports; have the worker re-verify its flows.
async fn resync(supervisor: &RpcState, bridge: &str) -> Result<(), ApiError> {
    if let Some(worker) = supervisor.workers().get(bridge).await {
        worker.resync().await?;
    }
    Ok(())
}
