//! Worker record model (in-memory, owned by the registry).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Worker status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Processing,
    Online,
    Offline,
    Error,
    Maintenance,
}

impl WorkerStatus {
    /// Statuses in which a worker is participating in the fleet.
    /// An erroring worker still heartbeats and counts as active.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkerStatus::Idle | WorkerStatus::Processing | WorkerStatus::Error
        )
    }
}

impl Default for WorkerStatus {
    fn default() -> Self {
        WorkerStatus::Idle
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Processing => write!(f, "processing"),
            WorkerStatus::Online => write!(f, "online"),
            WorkerStatus::Offline => write!(f, "offline"),
            WorkerStatus::Error => write!(f, "error"),
            WorkerStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// A connected (or recently connected) processing worker.
///
/// Owned exclusively by the worker registry and mutated only through
/// registration and heartbeat operations. The `camera_id` here is a
/// cross-reference into the durable lease store; the lease is the
/// authoritative record when the two disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub hostname: String,
    pub address: String,
    pub name: String,
    pub version: String,
    pub site_id: Option<Uuid>,
    pub capabilities: HashMap<String, serde_json::Value>,
    pub status: WorkerStatus,
    pub camera_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_error: Option<String>,
    pub error_count: u64,
    pub processed_total: u64,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// A worker is healthy when it is in an active status and its last
    /// heartbeat is within the staleness window.
    pub fn is_healthy(&self, staleness: Duration, now: DateTime<Utc>) -> bool {
        if !self.status.is_active() {
            return false;
        }
        let age = now.signed_duration_since(self.last_heartbeat);
        age.to_std().map(|a| a <= staleness).unwrap_or(true)
    }

    /// Uptime since registration; zero while unhealthy.
    pub fn uptime(&self, staleness: Duration, now: DateTime<Utc>) -> Duration {
        if !self.is_healthy(staleness, now) {
            return Duration::ZERO;
        }
        now.signed_duration_since(self.registered_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
