//! Camera Fleet Orchestration - Main Entry Point

use std::sync::Arc;

use camfleet_backend::{
    api::{self, AppState},
    config::Config,
    db,
    error::Result,
    services::{
        lease_store::{LeaseStore, MemoryLeaseStore, PgLeaseStore},
        metrics_service, scheduler_service,
    },
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    telemetry::init_tracing();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting camera fleet orchestrator");

    // Connect to database and run migrations. LEASE_STORE=memory runs the
    // whole service against the in-memory store (development only).
    let (db_pool, store): (Option<sqlx::PgPool>, Arc<dyn LeaseStore>) =
        if std::env::var("LEASE_STORE").as_deref() == Ok("memory") {
            tracing::warn!("Using in-memory lease store; state is not durable");
            (None, Arc::new(MemoryLeaseStore::new()))
        } else {
            let pool = db::create_pool(&config.database_url).await?;
            tracing::info!("Connected to database");
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("Database migrations complete");
            (Some(pool.clone()), Arc::new(PgLeaseStore::new(pool)))
        };

    // Initialize metrics
    let metrics_handle = metrics_service::init_metrics();

    // Wire up services and spawn the maintenance loops
    let state = Arc::new(
        AppState::new(config.clone(), db_pool, store).with_metrics_handle(metrics_handle),
    );
    let scheduler = scheduler_service::spawn_all(
        config.tuning.clone(),
        state.assignment.clone(),
        state.registry.clone(),
        state.commands.clone(),
        state.intents.clone(),
    );

    // Build and serve the router
    let app = api::routes::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Listening on {}", config.bind_address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}
