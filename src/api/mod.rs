//! API module - HTTP handlers and shared state.

pub mod dto;
pub mod handlers;
pub mod routes;

use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use crate::protocol::connection::{ConnectionManager, FleetProtocol};
use crate::protocol::intent::IntentTracker;
use crate::services::assignment_service::AssignmentService;
use crate::services::command_service::CommandService;
use crate::services::event_bus::EventBus;
use crate::services::lease_store::LeaseStore;
use crate::services::registry_service::WorkerRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Absent when running against the in-memory lease store.
    pub db: Option<PgPool>,
    pub store: Arc<dyn LeaseStore>,
    pub registry: Arc<WorkerRegistry>,
    pub assignment: Arc<AssignmentService>,
    pub commands: Arc<CommandService>,
    pub intents: Arc<IntentTracker>,
    pub connections: Arc<ConnectionManager>,
    pub protocol: Arc<FleetProtocol>,
    pub event_bus: Arc<EventBus>,
    pub metrics_handle: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    /// Wire up the service graph around a lease store.
    pub fn new(config: Config, db: Option<PgPool>, store: Arc<dyn LeaseStore>) -> Self {
        let event_bus = Arc::new(EventBus::new(256));
        let registry = Arc::new(WorkerRegistry::new(
            config.tuning.heartbeat_staleness,
            event_bus.clone(),
        ));
        let commands = Arc::new(CommandService::new(event_bus.clone()));
        let intents = Arc::new(IntentTracker::new());
        let connections = Arc::new(ConnectionManager::new());
        let assignment = Arc::new(AssignmentService::new(
            store.clone(),
            registry.clone(),
            commands.clone(),
            event_bus.clone(),
            config.tuning.lease_ttl,
        ));
        let protocol = Arc::new(FleetProtocol::new(
            registry.clone(),
            assignment.clone(),
            commands.clone(),
            intents.clone(),
            connections.clone(),
            event_bus.clone(),
        ));
        Self {
            config,
            db,
            store,
            registry,
            assignment,
            commands,
            intents,
            connections,
            protocol,
            event_bus,
            metrics_handle: None,
        }
    }

    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(Arc::new(handle));
        self
    }

    /// Flush a worker's pending queue over its live connection, if any.
    ///
    /// Commands for an offline worker stay queued; the connection layer
    /// flushes them on the next heartbeat after reconnect.
    pub async fn push_pending(&self, worker_id: uuid::Uuid) {
        if !self.connections.is_connected(worker_id).await {
            return;
        }
        for frame in self.protocol.dispatch_pending(worker_id).await {
            if !self.connections.send(worker_id, frame).await {
                tracing::warn!(%worker_id, "Dropped outbound frame for slow connection");
            }
        }
    }
}

pub type SharedState = Arc<AppState>;
