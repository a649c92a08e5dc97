//! In-memory worker registry.
//!
//! Authoritative, TTL-governed directory of connected workers. Records are
//! created by registration, mutated by heartbeats, and evicted either
//! explicitly or by the staleness sweep. The registry is process-local;
//! the durable lease store is the one place racing writers are arbitrated.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::worker::{WorkerRecord, WorkerStatus};
use crate::services::event_bus::{EventBus, FleetEvent};

/// Registration payload for a worker.
#[derive(Debug, Clone)]
pub struct RegisterWorkerRequest {
    pub tenant_id: Uuid,
    pub hostname: String,
    pub address: String,
    pub name: String,
    pub version: String,
    pub capabilities: HashMap<String, serde_json::Value>,
    pub site_id: Option<Uuid>,
}

/// Heartbeat payload from a worker.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub status: WorkerStatus,
    pub processed_delta: u64,
    pub error: Option<String>,
    pub capabilities: Option<HashMap<String, serde_json::Value>>,
    pub current_camera_id: Option<Uuid>,
}

/// Filters for listing workers.
#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub tenant_id: Option<Uuid>,
    pub status: Option<WorkerStatus>,
    pub site_id: Option<Uuid>,
    pub include_offline: bool,
}

/// Worker registry service.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<Uuid, WorkerRecord>>,
    staleness: Duration,
    events: Arc<EventBus>,
}

impl WorkerRegistry {
    pub fn new(staleness: Duration, events: Arc<EventBus>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            staleness,
            events,
        }
    }

    /// Heartbeat staleness window used by the health predicate.
    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Register a worker, or update an existing record for the same
    /// tenant + hostname in place (a reconnection).
    pub async fn register(&self, req: RegisterWorkerRequest) -> WorkerRecord {
        let now = Utc::now();
        let mut workers = self.workers.write().await;

        let existing_id = workers
            .values()
            .find(|w| w.tenant_id == req.tenant_id && w.hostname == req.hostname)
            .map(|w| w.id);

        let record = match existing_id {
            Some(id) => {
                let w = workers.get_mut(&id).unwrap();
                w.address = req.address;
                w.name = req.name;
                w.version = req.version;
                w.capabilities = req.capabilities;
                w.site_id = req.site_id.or(w.site_id);
                w.status = WorkerStatus::Idle;
                w.last_heartbeat = now;
                w.last_error = None;
                w.registered_at = now;
                tracing::info!(worker_id = %id, hostname = %w.hostname, "Worker reconnected");
                w.clone()
            }
            None => {
                let record = WorkerRecord {
                    id: Uuid::new_v4(),
                    tenant_id: req.tenant_id,
                    hostname: req.hostname,
                    address: req.address,
                    name: req.name,
                    version: req.version,
                    site_id: req.site_id,
                    capabilities: req.capabilities,
                    status: WorkerStatus::Idle,
                    camera_id: None,
                    last_heartbeat: now,
                    last_error: None,
                    error_count: 0,
                    processed_total: 0,
                    registered_at: now,
                };
                tracing::info!(worker_id = %record.id, hostname = %record.hostname, "Worker registered");
                workers.insert(record.id, record.clone());
                record
            }
        };

        self.events.publish(FleetEvent::now(
            "worker.registered",
            Some(record.id),
            None,
            None,
        ));
        record
    }

    /// Apply a heartbeat. Returns `None` for an unknown worker; the caller
    /// must treat that as "worker should re-register".
    pub async fn heartbeat(&self, worker_id: Uuid, update: HeartbeatUpdate) -> Option<WorkerRecord> {
        let mut workers = self.workers.write().await;
        let w = workers.get_mut(&worker_id)?;

        w.last_heartbeat = Utc::now();
        w.processed_total = w.processed_total.saturating_add(update.processed_delta);
        if let Some(caps) = update.capabilities {
            w.capabilities = caps;
        }

        match update.status {
            WorkerStatus::Offline => {
                // The registry releases its own view; the durable lease is
                // released by the assignment service.
                w.camera_id = None;
                w.status = WorkerStatus::Offline;
                self.events
                    .publish(FleetEvent::now("worker.offline", Some(w.id), None, None));
            }
            WorkerStatus::Error => {
                w.status = WorkerStatus::Error;
                w.error_count += 1;
                w.last_error = update.error.clone();
            }
            status => {
                w.status = status;
                if status.is_active() {
                    w.last_error = None;
                }
            }
        }

        // Soft inconsistency: the worker claims a camera the registry does
        // not have on record for it. The lease store is authoritative, so
        // record the disagreement and surface it without failing the beat.
        if w.status == WorkerStatus::Processing {
            if let Some(reported) = update.current_camera_id {
                if w.camera_id != Some(reported) {
                    let detail = format!(
                        "worker reports camera {reported}, registry has {:?}",
                        w.camera_id
                    );
                    tracing::warn!(worker_id = %w.id, %detail, "Camera assignment mismatch");
                    w.last_error = Some(detail.clone());
                    self.events.publish(FleetEvent::now(
                        "worker.camera_mismatch",
                        Some(w.id),
                        Some(reported),
                        Some(detail),
                    ));
                }
            }
        }

        Some(w.clone())
    }

    pub async fn get(&self, worker_id: Uuid) -> Option<WorkerRecord> {
        self.workers.read().await.get(&worker_id).cloned()
    }

    /// List workers matching the filter. Offline workers are excluded
    /// unless requested.
    pub async fn list(&self, filter: WorkerFilter) -> Vec<WorkerRecord> {
        let workers = self.workers.read().await;
        let mut out: Vec<WorkerRecord> = workers
            .values()
            .filter(|w| {
                filter.tenant_id.map(|t| w.tenant_id == t).unwrap_or(true)
                    && filter.status.map(|s| w.status == s).unwrap_or(true)
                    && filter.site_id.map(|s| w.site_id == Some(s)).unwrap_or(true)
                    && (filter.include_offline || w.status != WorkerStatus::Offline)
            })
            .cloned()
            .collect();
        out.sort_by_key(|w| w.registered_at);
        out
    }

    /// Remove a worker record, returning it so the caller can release any
    /// lease it still holds.
    pub async fn remove(&self, worker_id: Uuid) -> Option<WorkerRecord> {
        let removed = self.workers.write().await.remove(&worker_id);
        if let Some(ref w) = removed {
            tracing::info!(worker_id = %w.id, "Worker removed from registry");
            self.events
                .publish(FleetEvent::now("worker.removed", Some(w.id), w.camera_id, None));
        }
        removed
    }

    /// Record a successful camera assignment for a worker.
    pub async fn set_assignment(&self, worker_id: Uuid, camera_id: Uuid) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(&worker_id) {
            Some(w) => {
                w.camera_id = Some(camera_id);
                w.status = WorkerStatus::Processing;
                true
            }
            None => false,
        }
    }

    /// Clear a worker's camera assignment if it still points at `camera_id`,
    /// returning whether anything changed.
    pub async fn clear_assignment(&self, worker_id: Uuid, camera_id: Uuid) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(&worker_id) {
            Some(w) if w.camera_id == Some(camera_id) => {
                w.camera_id = None;
                if w.status == WorkerStatus::Processing {
                    w.status = WorkerStatus::Idle;
                }
                true
            }
            _ => false,
        }
    }

    /// Mark a worker offline (explicit stop or abnormal disconnect).
    /// Returns the camera it held, if any, so the caller can release the lease.
    pub async fn mark_offline(&self, worker_id: Uuid) -> Option<Uuid> {
        let mut workers = self.workers.write().await;
        let w = workers.get_mut(&worker_id)?;
        let held = w.camera_id.take();
        w.status = WorkerStatus::Offline;
        drop(workers);
        tracing::info!(worker_id = %worker_id, camera_id = ?held, "Worker marked offline");
        self.events
            .publish(FleetEvent::now("worker.offline", Some(worker_id), held, None));
        held
    }

    /// Evict workers whose heartbeat age exceeds `ttl`. Returns the removed
    /// records so the caller can release their leases.
    pub async fn sweep_stale(&self, ttl: Duration) -> Vec<WorkerRecord> {
        let now = Utc::now();
        let mut workers = self.workers.write().await;
        let stale: Vec<Uuid> = workers
            .values()
            .filter(|w| {
                now.signed_duration_since(w.last_heartbeat)
                    .to_std()
                    .map(|age| age > ttl)
                    .unwrap_or(false)
            })
            .map(|w| w.id)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(w) = workers.remove(&id) {
                tracing::warn!(worker_id = %id, hostname = %w.hostname, "Evicting stale worker");
                self.events
                    .publish(FleetEvent::now("worker.evicted", Some(id), w.camera_id, None));
                removed.push(w);
            }
        }
        removed
    }

    /// Number of registered workers (all statuses).
    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}
