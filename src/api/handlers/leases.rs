//! Lease handlers: assignment, renewal, reclaim, and status.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::dto::{CameraSummary, LeaseResponse};
use crate::api::SharedState;
use crate::error::Result;
use crate::models::lease::LeaseState;
use crate::protocol::message::LeaseRenewal;
use crate::services::assignment_service::RenewalResult;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/assign", post(assign))
        .route("/renew", post(renew))
        .route("/reclaim", post(reclaim))
        .route("/status", get(status))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub tenant_id: Uuid,
    pub worker_id: Uuid,
    pub site_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    /// `None` means every candidate is held; try again later.
    pub camera: Option<CameraSummary>,
}

/// Lease a camera to a worker. Exhaustion is a normal response, not an
/// error.
pub async fn assign(
    State(state): State<SharedState>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<AssignResponse>> {
    let camera = state
        .assignment
        .assign(req.tenant_id, req.worker_id, req.site_id)
        .await?;
    state.push_pending(req.worker_id).await;
    Ok(Json(AssignResponse {
        camera: camera.map(CameraSummary::from),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    pub worker_id: Uuid,
    pub renewals: Vec<LeaseRenewal>,
}

#[derive(Debug, Serialize)]
pub struct RenewResponse {
    pub results: Vec<RenewalResult>,
}

pub async fn renew(
    State(state): State<SharedState>,
    Json(req): Json<RenewRequest>,
) -> Result<Json<RenewResponse>> {
    let pairs: Vec<(Uuid, i64)> = req
        .renewals
        .iter()
        .map(|r| (r.camera_id, r.generation))
        .collect();
    let results = state.assignment.renew(req.worker_id, &pairs).await;
    Ok(Json(RenewResponse { results }))
}

#[derive(Debug, Serialize)]
pub struct ReclaimResponse {
    pub reclaimed_count: usize,
}

/// Run one reclaim pass immediately (the background loop also runs this).
pub async fn reclaim(State(state): State<SharedState>) -> Result<Json<ReclaimResponse>> {
    let reclaimed_count = state.assignment.reclaim_expired().await?;
    Ok(Json(ReclaimResponse { reclaimed_count }))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub tenant_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct LeaseStatusResponse {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub orphaned: usize,
    pub leases: Vec<LeaseResponse>,
}

pub async fn status(
    State(state): State<SharedState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<LeaseStatusResponse>> {
    let now = Utc::now();
    let leases = state
        .store
        .list_leases(query.tenant_id, query.worker_id)
        .await?;

    let mut active = 0;
    let mut expired = 0;
    let mut orphaned = 0;
    for lease in &leases {
        match lease.state {
            LeaseState::Active if lease.is_expired(now) => expired += 1,
            LeaseState::Active => active += 1,
            LeaseState::Orphaned => orphaned += 1,
            _ => {}
        }
    }
    Ok(Json(LeaseStatusResponse {
        total: leases.len(),
        active,
        expired,
        orphaned,
        leases: leases.into_iter().map(LeaseResponse::from).collect(),
    }))
}
