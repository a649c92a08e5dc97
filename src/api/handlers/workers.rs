//! Worker registry handlers: registration, heartbeats, listing, removal.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::api::dto::{CameraSummary, WorkerResponse};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::worker::WorkerStatus;
use crate::protocol::message::LeaseRenewal;
use crate::services::assignment_service::RenewalResult;
use crate::services::registry_service::{HeartbeatUpdate, RegisterWorkerRequest, WorkerFilter};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_workers))
        .route("/register", post(register_worker))
        .route("/:id", get(get_worker).delete(remove_worker))
        .route("/:id/heartbeat", post(heartbeat))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub tenant_id: Uuid,
    pub hostname: String,
    pub address: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub site_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub worker: WorkerResponse,
    /// Camera leased by the auto-assignment attempt, when a site was given.
    pub assigned_camera: Option<CameraSummary>,
}

/// Register a worker; re-registration for the same tenant+hostname is a
/// reconnection. Providing a site triggers one assignment attempt.
pub async fn register_worker(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    let record = state
        .registry
        .register(RegisterWorkerRequest {
            tenant_id: req.tenant_id,
            hostname: req.hostname,
            address: req.address,
            name: req.name,
            version: req.version,
            capabilities: req.capabilities,
            site_id: req.site_id,
        })
        .await;

    let assigned_camera = match req.site_id {
        Some(site_id) => match state.assignment.assign(req.tenant_id, record.id, site_id).await {
            Ok(camera) => camera.map(CameraSummary::from),
            Err(e) => {
                tracing::warn!(worker_id = %record.id, "Auto-assignment at registration failed: {e}");
                None
            }
        },
        None => None,
    };
    // An assignment updates the record; re-read for the response.
    let record = state.registry.get(record.id).await.unwrap_or(record);

    state.push_pending(record.id).await;
    Ok(Json(RegisterResponse {
        worker: WorkerResponse::from_record(record, state.registry.staleness()),
        assigned_camera,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default)]
    pub processed_delta: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub capabilities: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub current_camera_id: Option<Uuid>,
    #[serde(default)]
    pub renewals: Vec<LeaseRenewal>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub worker: WorkerResponse,
    pub renewals: Vec<RenewalResult>,
}

/// Apply a heartbeat and process any embedded lease renewals.
pub async fn heartbeat(
    State(state): State<SharedState>,
    Path(worker_id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    let record = state
        .registry
        .heartbeat(
            worker_id,
            HeartbeatUpdate {
                status: req.status,
                processed_delta: req.processed_delta,
                error: req.error,
                capabilities: req.capabilities,
                current_camera_id: req.current_camera_id,
            },
        )
        .await
        .ok_or_else(|| AppError::NotFound(format!("Worker {worker_id} not registered")))?;

    // An offline transition releases the durable leases too; the registry
    // only clears its own cross-reference.
    if req.status == WorkerStatus::Offline {
        state
            .assignment
            .release_for_worker(worker_id, "worker offline")
            .await?;
    }

    let pairs: Vec<(Uuid, i64)> = req
        .renewals
        .iter()
        .map(|r| (r.camera_id, r.generation))
        .collect();
    let renewals = state.assignment.renew(worker_id, &pairs).await;

    if req.status != WorkerStatus::Offline {
        state.push_pending(worker_id).await;
    }
    Ok(Json(HeartbeatResponse {
        worker: WorkerResponse::from_record(record, state.registry.staleness()),
        renewals,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListWorkersQuery {
    pub tenant_id: Option<Uuid>,
    pub status: Option<WorkerStatus>,
    pub site_id: Option<Uuid>,
    #[serde(default)]
    pub include_offline: bool,
}

#[derive(Debug, Serialize)]
pub struct WorkerListResponse {
    pub items: Vec<WorkerResponse>,
    pub total: usize,
}

pub async fn list_workers(
    State(state): State<SharedState>,
    Query(query): Query<ListWorkersQuery>,
) -> Result<Json<WorkerListResponse>> {
    let staleness = state.registry.staleness();
    let items: Vec<WorkerResponse> = state
        .registry
        .list(WorkerFilter {
            tenant_id: query.tenant_id,
            status: query.status,
            site_id: query.site_id,
            include_offline: query.include_offline,
        })
        .await
        .into_iter()
        .map(|w| WorkerResponse::from_record(w, staleness))
        .collect();
    let total = items.len();
    Ok(Json(WorkerListResponse { items, total }))
}

pub async fn get_worker(
    State(state): State<SharedState>,
    Path(worker_id): Path<Uuid>,
) -> Result<Json<WorkerResponse>> {
    let record = state
        .registry
        .get(worker_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Worker {worker_id} not registered")))?;
    Ok(Json(WorkerResponse::from_record(
        record,
        state.registry.staleness(),
    )))
}

/// Remove a worker: leases released, queues dropped, intents forgotten.
pub async fn remove_worker(
    State(state): State<SharedState>,
    Path(worker_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    state
        .registry
        .remove(worker_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Worker {worker_id} not registered")))?;
    let released = state
        .assignment
        .release_for_worker(worker_id, "worker removed")
        .await?;
    state.commands.forget_worker(worker_id).await;
    state.intents.forget_worker(worker_id).await;
    Ok(Json(serde_json::json!({
        "removed": worker_id,
        "leases_released": released,
    })))
}
