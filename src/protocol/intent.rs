//! Intent correlation for the worker connection protocol.
//!
//! Every server-to-worker message that expects a reaction is tracked here
//! until an ACK resolves it or the timeout sweep drops it. This tracker is
//! deliberately redundant with the command service's own expiry: the
//! command service governs dispatch and retry, this governs protocol-level
//! correlation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Lifecycle of a tracked intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Pending,
    Acknowledged,
    Failed,
}

/// A server-issued directive awaiting worker acknowledgement.
#[derive(Debug, Clone)]
pub struct Intent {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub message_type: String,
    /// Command id this intent was dispatched for, when applicable.
    pub correlation_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: IntentStatus,
}

/// In-memory intent table.
#[derive(Default)]
pub struct IntentTracker {
    intents: Mutex<HashMap<Uuid, Intent>>,
}

impl IntentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly issued intent.
    pub async fn track(
        &self,
        worker_id: Uuid,
        message_type: &str,
        correlation_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> Uuid {
        let intent = Intent {
            id: Uuid::new_v4(),
            worker_id,
            message_type: message_type.to_string(),
            correlation_id,
            payload,
            created_at: Utc::now(),
            status: IntentStatus::Pending,
        };
        let id = intent.id;
        self.intents.lock().await.insert(id, intent);
        id
    }

    /// Resolve an intent by id, removing it from the table.
    ///
    /// Returns `None` for unknown ids: a late or duplicate ACK after the
    /// sweep has dropped the intent is an expected race, logged by the
    /// caller and discarded.
    pub async fn resolve(&self, intent_id: Uuid) -> Option<Intent> {
        self.intents.lock().await.remove(&intent_id)
    }

    /// Drop intents older than `timeout`, returning them for logging.
    pub async fn sweep(&self, timeout: Duration) -> Vec<Intent> {
        let now = Utc::now();
        let mut intents = self.intents.lock().await;
        let expired: Vec<Uuid> = intents
            .values()
            .filter(|i| {
                now.signed_duration_since(i.created_at)
                    .to_std()
                    .map(|age| age > timeout)
                    .unwrap_or(false)
            })
            .map(|i| i.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| intents.remove(&id))
            .collect()
    }

    /// Drop all intents for a worker (disconnect).
    pub async fn forget_worker(&self, worker_id: Uuid) {
        self.intents
            .lock()
            .await
            .retain(|_, i| i.worker_id != worker_id);
    }

    pub async fn len(&self) -> usize {
        self.intents.lock().await.len()
    }
}
