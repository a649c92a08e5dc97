//! Route definitions for the API.

use axum::http::{header, Method};
use axum::{middleware, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::SharedState;
use crate::services::metrics_service;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        // Health and metrics (no prefix)
        .route("/health", get(handlers::health::health_check))
        .route("/healthz", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        // Persistent worker connections
        .nest("/ws", handlers::ws::router())
        // API v1 routes
        .nest("/api/v1", api_v1_routes())
        .layer(middleware::from_fn(metrics_service::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn api_v1_routes() -> Router<SharedState> {
    Router::new()
        .nest("/workers", handlers::workers::router())
        .nest("/leases", handlers::leases::router())
        .nest("/commands", handlers::commands::router())
        .nest("/worker-management", handlers::commands::management_router())
        .nest("/events", handlers::events::router())
}
