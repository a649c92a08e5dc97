//! Health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::api::SharedState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: CheckStatus,
    pub registry: CheckStatus,
}

#[derive(Serialize)]
pub struct CheckStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health check endpoint - basic liveness check
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let db_check = match &state.db {
        Some(db) => match sqlx::query("SELECT 1").fetch_one(db).await {
            Ok(_) => CheckStatus {
                status: "healthy".to_string(),
                message: None,
            },
            Err(e) => CheckStatus {
                status: "unhealthy".to_string(),
                message: Some(format!("Database connection failed: {e}")),
            },
        },
        None => CheckStatus {
            status: "healthy".to_string(),
            message: Some("in-memory lease store".to_string()),
        },
    };

    let worker_count = state.registry.len().await;
    let connected = state.connections.connected_count().await;
    let registry_check = CheckStatus {
        status: "healthy".to_string(),
        message: Some(format!("{worker_count} registered, {connected} connected")),
    };

    let healthy = db_check.status == "healthy";
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            registry: registry_check,
        },
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Render Prometheus metrics.
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
