//! Command queue handlers: dispatch, lifecycle, and history.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::api::dto::CommandResponse;
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::command::{CommandPriority, CommandType};
use crate::services::command_service::SendCommandRequest;

/// Routes addressed by command or worker id. The router requires one
/// parameter name per position, so both go by `:id`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/:id/pending", get(pending))
        .route("/:id/history", get(history))
        .route("/:id/acknowledge", post(acknowledge))
        .route("/:id/complete", post(complete))
        .route("/:id/retry", post(retry))
        .route("/:id", get(get_command).delete(cancel))
}

/// Routes under `/worker-management`.
pub fn management_router() -> Router<SharedState> {
    Router::new().route("/send-command/:worker_id", post(send_command))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub command: CommandType,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Option<CommandPriority>,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub command_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Queue a command for a worker. Returns immediately; the terminal outcome
/// is discoverable by polling the command.
pub async fn send_command(
    State(state): State<SharedState>,
    Path(worker_id): Path<Uuid>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>> {
    state
        .registry
        .get(worker_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Worker {worker_id} not registered")))?;

    let command = state
        .commands
        .send(SendCommandRequest {
            worker_id,
            command_type: req.command,
            parameters: req.parameters,
            priority: req.priority.unwrap_or(CommandPriority::Normal),
            requested_by: req.requested_by,
            timeout_override: req.timeout_minutes.map(|m| Duration::from_secs(m * 60)),
        })
        .await;
    let response = SendResponse {
        command_id: command.id,
        expires_at: command.expires_at,
    };
    state.push_pending(worker_id).await;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct CommandListResponse {
    pub items: Vec<CommandResponse>,
    pub total: usize,
}

pub async fn pending(
    State(state): State<SharedState>,
    Path(worker_id): Path<Uuid>,
) -> Result<Json<CommandListResponse>> {
    let items: Vec<CommandResponse> = state
        .commands
        .pending_for(worker_id)
        .await
        .into_iter()
        .map(CommandResponse::from)
        .collect();
    let total = items.len();
    Ok(Json(CommandListResponse { items, total }))
}

pub async fn history(
    State(state): State<SharedState>,
    Path(worker_id): Path<Uuid>,
) -> Result<Json<CommandListResponse>> {
    let items: Vec<CommandResponse> = state
        .commands
        .history_for(worker_id)
        .await
        .into_iter()
        .map(CommandResponse::from)
        .collect();
    let total = items.len();
    Ok(Json(CommandListResponse { items, total }))
}

pub async fn get_command(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CommandResponse>> {
    let command = state
        .commands
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Command {id} not found")))?;
    Ok(Json(CommandResponse::from(command)))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub worker_id: Uuid,
}

pub async fn acknowledge(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AcknowledgeRequest>,
) -> Result<Json<CommandResponse>> {
    let command = state.commands.acknowledge(id, req.worker_id).await?;
    Ok(Json(CommandResponse::from(command)))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub worker_id: Uuid,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

pub async fn complete(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CommandResponse>> {
    let command = state
        .commands
        .complete(id, req.worker_id, req.result, req.error_message)
        .await?;
    Ok(Json(CommandResponse::from(command)))
}

/// Re-queue a failed or stuck command at the front of the queue.
pub async fn retry(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CommandResponse>> {
    let command = state.commands.retry(id).await?;
    state.push_pending(command.worker_id).await;
    Ok(Json(CommandResponse::from(command)))
}

/// Cancel a command not yet acknowledged. The worker is not notified.
pub async fn cancel(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CommandResponse>> {
    let command = state.commands.cancel(id).await?;
    Ok(Json(CommandResponse::from(command)))
}
