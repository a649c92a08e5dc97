use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A fleet event published when orchestration state changes.
#[derive(Debug, Clone, Serialize)]
pub struct FleetEvent {
    /// Event type, e.g. "worker.registered", "lease.reclaimed"
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl FleetEvent {
    /// Create a fleet event timestamped to now.
    pub fn now(
        event_type: impl Into<String>,
        worker_id: Option<Uuid>,
        camera_id: Option<Uuid>,
        detail: Option<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            worker_id,
            camera_id,
            detail,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Broadcast-based event bus for fleet events.
///
/// Observers subscribe explicitly via `tokio::sync::broadcast` instead of
/// registering callbacks on the services. If a subscriber falls behind it
/// receives `RecvError::Lagged` and should refetch fleet state.
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a fleet event. If there are no subscribers the event is dropped silently.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to fleet events.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}
