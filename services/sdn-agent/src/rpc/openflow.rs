//! Per-owner flow tables.
//!
//! Flows are exchanged in the `ovs-ofctl` text form. Every flow accepted
//! here is stamped with the agent cookie so the worker manages it.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use sdnagent_flows::{Flow, AGENT_COOKIE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ApiError, RpcState};
use crate::error::WorkerError;
use crate::worker::{BridgeWorker, WorkerStatus};

pub fn routes() -> Router<RpcState> {
    Router::new()
        .route("/bridges/{bridge}/flows", get(get_flows))
        .route(
            "/bridges/{bridge}/flows/{owner}",
            put(replace_flows).post(add_flows).delete(clear_flows),
        )
        .route("/bridges/{bridge}/flows/{owner}/delete", post(del_flows))
}

#[derive(Debug, Deserialize)]
pub struct FlowsRequest {
    pub flows: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FlowsResponse {
    pub bridge: String,
    pub owners: BTreeMap<String, Vec<String>>,
    pub status: WorkerStatus,
}

fn parse_flows(request: FlowsRequest) -> Result<Vec<Flow>, ApiError> {
    request
        .flows
        .iter()
        .map(|text| {
            text.parse::<Flow>()
                .map(|flow| flow.with_cookie(AGENT_COOKIE))
                .map_err(|e| ApiError::bad_request("invalid_flow", format!("{text:?}: {e}")))
        })
        .collect()
}

async fn existing_worker(supervisor: &RpcState, bridge: &str) -> Result<BridgeWorker, ApiError> {
    supervisor
        .workers()
        .get(bridge)
        .await
        .ok_or_else(|| ApiError::not_found("no_such_bridge", format!("no worker for bridge {bridge}")))
}

#[derive(Debug, Clone, Copy)]
enum Push {
    Replace,
    Add,
}

async fn push_to(
    worker: &BridgeWorker,
    owner: &str,
    flows: Vec<Flow>,
    push: Push,
) -> Result<(), WorkerError> {
    match push {
        Push::Replace => worker.replace_flows(owner, flows).await,
        Push::Add => worker.add_flows(owner, flows).await,
    }
}

/// Push to the bridge's worker, resolving it again once if it was evicted
/// in between.
async fn push_flows(
    supervisor: &RpcState,
    bridge: &str,
    owner: &str,
    flows: Vec<Flow>,
    push: Push,
) -> Result<(), ApiError> {
    let worker = supervisor.get_or_create_worker(bridge).await?;
    if push_to(&worker, owner, flows.clone(), push).await.is_ok() {
        return Ok(());
    }

    debug!(bridge, owner, "Worker went away, retrying with a fresh one");
    let worker = supervisor.get_or_create_worker(bridge).await?;
    push_to(&worker, owner, flows, push).await?;
    Ok(())
}

async fn get_flows(
    State(supervisor): State<RpcState>,
    Path(bridge): Path<String>,
) -> Result<Json<FlowsResponse>, ApiError> {
    let worker = existing_worker(&supervisor, &bridge).await?;
    let snapshot = worker.snapshot().await?;

    let owners = snapshot
        .owners
        .into_iter()
        .map(|(owner, flows)| (owner, flows.iter().map(Flow::to_string).collect()))
        .collect();

    Ok(Json(FlowsResponse {
        bridge: snapshot.bridge,
        owners,
        status: snapshot.status,
    }))
}

async fn replace_flows(
    State(supervisor): State<RpcState>,
    Path((bridge, owner)): Path<(String, String)>,
    Json(request): Json<FlowsRequest>,
) -> Result<StatusCode, ApiError> {
    let flows = parse_flows(request)?;
    let count = flows.len();
    push_flows(&supervisor, &bridge, &owner, flows, Push::Replace).await?;
    info!(bridge = %bridge, owner = %owner, count, "Flows replaced via RPC");
    Ok(StatusCode::NO_CONTENT)
}

async fn add_flows(
    State(supervisor): State<RpcState>,
    Path((bridge, owner)): Path<(String, String)>,
    Json(request): Json<FlowsRequest>,
) -> Result<StatusCode, ApiError> {
    let flows = parse_flows(request)?;
    let count = flows.len();
    push_flows(&supervisor, &bridge, &owner, flows, Push::Add).await?;
    info!(bridge = %bridge, owner = %owner, count, "Flows added via RPC");
    Ok(StatusCode::NO_CONTENT)
}

async fn del_flows(
    State(supervisor): State<RpcState>,
    Path((bridge, owner)): Path<(String, String)>,
    Json(request): Json<FlowsRequest>,
) -> Result<StatusCode, ApiError> {
    let flows = parse_flows(request)?;
    let count = flows.len();
    let worker = existing_worker(&supervisor, &bridge).await?;
    worker.del_flows(owner.as_str(), flows).await?;
    info!(bridge = %bridge, owner = %owner, count, "Flows deleted via RPC");
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_flows(
    State(supervisor): State<RpcState>,
    Path((bridge, owner)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let worker = existing_worker(&supervisor, &bridge).await?;
    worker.clear_flows(owner.as_str()).await?;
    info!(bridge = %bridge, owner = %owner, "Flows cleared via RPC");
    Ok(StatusCode::NO_CONTENT)
}
