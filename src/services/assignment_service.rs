//! Camera assignment: lease acquisition, renewal, and reclaim.
//!
//! Acquisition walks the candidate cameras for a site and attempts a
//! generation-guarded acquire on each. A conflict on one candidate moves
//! straight to the next: the losing contender must not spin on a camera
//! another worker just won. Exhausting all candidates is a legitimate
//! steady state, not an error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::camera::Camera;
use crate::models::command::{CommandPriority, CommandType};
use crate::services::command_service::{CommandService, SendCommandRequest};
use crate::services::event_bus::{EventBus, FleetEvent};
use crate::services::lease_store::LeaseStore;
use crate::services::metrics_service;
use crate::services::registry_service::WorkerRegistry;

/// Per-item outcome of a renewal batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenewalStatus {
    Renewed,
    Conflict,
    Error,
}

/// Result entry for one `(camera_id, generation)` renewal request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalResult {
    pub camera_id: Uuid,
    pub generation: i64,
    pub status: RenewalStatus,
}

/// Assignment service.
pub struct AssignmentService {
    store: Arc<dyn LeaseStore>,
    registry: Arc<WorkerRegistry>,
    commands: Arc<CommandService>,
    events: Arc<EventBus>,
    lease_ttl: Duration,
}

impl AssignmentService {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        registry: Arc<WorkerRegistry>,
        commands: Arc<CommandService>,
        events: Arc<EventBus>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            commands,
            events,
            lease_ttl,
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Try to lease a camera in `site_id` to `worker_id`.
    ///
    /// Returns `Ok(None)` when every candidate is held — the caller should
    /// try again later, not treat it as a failure.
    pub async fn assign(
        &self,
        tenant_id: Uuid,
        worker_id: Uuid,
        site_id: Uuid,
    ) -> Result<Option<Camera>> {
        let worker = self
            .registry
            .get(worker_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Worker {worker_id} not registered")))?;
        if worker.tenant_id != tenant_id {
            return Err(AppError::Validation(format!(
                "Worker {worker_id} does not belong to tenant {tenant_id}"
            )));
        }
        // One camera per worker: the registry tracks a single assignment,
        // so a second acquisition would strand the first lease.
        if let Some(held) = worker.camera_id {
            return Err(AppError::Conflict(format!(
                "Worker {worker_id} already holds camera {held}"
            )));
        }

        let candidates = self.store.list_active_cameras(tenant_id, site_id).await?;
        if candidates.is_empty() {
            tracing::debug!(%tenant_id, %site_id, "No active cameras at site");
            return Ok(None);
        }

        for camera in candidates {
            let lease = self.store.get_or_create(&camera).await?;
            let affected = self
                .store
                .try_acquire(camera.id, worker_id, lease.generation, self.lease_ttl)
                .await?;
            if affected == 0 {
                // Another worker won this candidate; move on.
                metrics_service::record_assignment_conflict();
                continue;
            }

            let generation = lease.generation + 1;
            self.registry.set_assignment(worker_id, camera.id).await;

            let mut parameters = HashMap::new();
            parameters.insert("camera_id".into(), serde_json::json!(camera.id));
            parameters.insert("generation".into(), serde_json::json!(generation));
            parameters.insert("source_url".into(), serde_json::json!(camera.source_url));
            self.commands
                .send(SendCommandRequest {
                    worker_id,
                    command_type: CommandType::Start,
                    parameters,
                    priority: CommandPriority::High,
                    requested_by: Some("assignment".into()),
                    timeout_override: None,
                })
                .await;

            tracing::info!(
                %worker_id,
                camera_id = %camera.id,
                generation,
                "Camera leased to worker"
            );
            metrics_service::record_assignment("acquired");
            self.events.publish(FleetEvent::now(
                "lease.acquired",
                Some(worker_id),
                Some(camera.id),
                Some(format!("generation {generation}")),
            ));
            return Ok(Some(camera));
        }

        metrics_service::record_assignment("exhausted");
        tracing::debug!(%worker_id, %site_id, "No camera available for worker");
        Ok(None)
    }

    /// Extend the leases a worker believes it holds.
    ///
    /// A `conflict` entry means the caller's view is stale; it must
    /// re-request assignment rather than retry the renewal.
    pub async fn renew(
        &self,
        worker_id: Uuid,
        renewals: &[(Uuid, i64)],
    ) -> Vec<RenewalResult> {
        let mut results = Vec::with_capacity(renewals.len());
        for &(camera_id, generation) in renewals {
            let status = match self
                .store
                .renew(camera_id, worker_id, generation, self.lease_ttl)
                .await
            {
                Ok(1) => RenewalStatus::Renewed,
                Ok(_) => RenewalStatus::Conflict,
                Err(e) => {
                    tracing::error!(%camera_id, %worker_id, error = %e, "Lease renewal failed");
                    RenewalStatus::Error
                }
            };
            results.push(RenewalResult {
                camera_id,
                generation,
                status,
            });
        }
        results
    }

    /// Terminate every active lease whose TTL has lapsed and reconcile the
    /// registry. The sole mechanism guaranteeing a crashed holder cannot
    /// strand a camera past its TTL.
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let reclaimed = self.store.reclaim_expired().await?;
        for entry in &reclaimed {
            tracing::warn!(
                camera_id = %entry.camera_id,
                worker_id = ?entry.worker_id,
                "Reclaimed expired lease"
            );
            if let Some(worker_id) = entry.worker_id {
                self.registry
                    .clear_assignment(worker_id, entry.camera_id)
                    .await;
            }
            self.events.publish(FleetEvent::now(
                "lease.reclaimed",
                entry.worker_id,
                Some(entry.camera_id),
                None,
            ));
        }
        if !reclaimed.is_empty() {
            metrics_service::record_leases_reclaimed(reclaimed.len() as u64);
        }
        Ok(reclaimed.len())
    }

    /// Release every lease held by a worker (disconnect, eviction, or
    /// explicit removal).
    pub async fn release_for_worker(&self, worker_id: Uuid, reason: &str) -> Result<usize> {
        let held = self.store.list_leases(None, Some(worker_id)).await?;
        let mut released = 0;
        for lease in held {
            if self
                .store
                .release(lease.camera_id, worker_id, reason)
                .await?
                > 0
            {
                released += 1;
                self.registry
                    .clear_assignment(worker_id, lease.camera_id)
                    .await;
                self.events.publish(FleetEvent::now(
                    "lease.released",
                    Some(worker_id),
                    Some(lease.camera_id),
                    Some(reason.to_string()),
                ));
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lease::LeaseState;
    use crate::models::worker::WorkerStatus;
    use crate::services::lease_store::MemoryLeaseStore;
    use crate::services::registry_service::RegisterWorkerRequest;
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryLeaseStore>,
        registry: Arc<WorkerRegistry>,
        commands: Arc<CommandService>,
        assignment: AssignmentService,
    }

    fn fixture(lease_ttl: Duration) -> Fixture {
        let events = Arc::new(EventBus::new(64));
        let store = Arc::new(MemoryLeaseStore::new());
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(120), events.clone()));
        let commands = Arc::new(CommandService::new(events.clone()));
        let assignment = AssignmentService::new(
            store.clone(),
            registry.clone(),
            commands.clone(),
            events,
            lease_ttl,
        );
        Fixture {
            store,
            registry,
            commands,
            assignment,
        }
    }

    async fn register(f: &Fixture, tenant: Uuid, hostname: &str) -> Uuid {
        f.registry
            .register(RegisterWorkerRequest {
                tenant_id: tenant,
                hostname: hostname.into(),
                address: "10.0.0.5:9000".into(),
                name: hostname.into(),
                version: "1.0.0".into(),
                capabilities: HashMap::new(),
                site_id: None,
            })
            .await
            .id
    }

    fn camera(tenant: Uuid, site: Uuid, name: &str) -> Camera {
        Camera {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            site_id: site,
            name: name.into(),
            source_url: format!("rtsp://cams/{name}"),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn assign_unknown_worker_fails_fast() {
        let f = fixture(Duration::from_secs(90));
        let err = f
            .assignment
            .assign(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .await;
        assert!(matches!(err, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn assign_wrong_tenant_is_a_validation_error() {
        let f = fixture(Duration::from_secs(90));
        let worker = register(&f, Uuid::new_v4(), "w1").await;
        let err = f
            .assignment
            .assign(Uuid::new_v4(), worker, Uuid::new_v4())
            .await;
        assert!(matches!(err, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn assign_acquires_first_candidate_and_queues_start() {
        let f = fixture(Duration::from_secs(90));
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let worker = register(&f, tenant, "w1").await;
        let cam = camera(tenant, site, "entrance");
        f.store.add_camera(cam.clone()).await;

        let assigned = f.assignment.assign(tenant, worker, site).await.unwrap();
        assert_eq!(assigned.map(|c| c.id), Some(cam.id));

        let lease = f.store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.generation, 1);
        assert_eq!(lease.state, LeaseState::Active);
        assert_eq!(lease.worker_id, Some(worker));

        let record = f.registry.get(worker).await.unwrap();
        assert_eq!(record.camera_id, Some(cam.id));
        assert_eq!(record.status, WorkerStatus::Processing);

        let pending = f.commands.pending_for(worker).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_type, CommandType::Start);
        assert_eq!(
            pending[0].parameters.get("generation"),
            Some(&serde_json::json!(1))
        );
    }

    #[tokio::test]
    async fn holder_cannot_acquire_a_second_camera() {
        let f = fixture(Duration::from_secs(90));
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let worker = register(&f, tenant, "w1").await;

        let mut first = camera(tenant, site, "entrance");
        first.created_at = Utc::now() - chrono::Duration::seconds(5);
        let second = camera(tenant, site, "checkout");
        f.store.add_camera(first.clone()).await;
        f.store.add_camera(second.clone()).await;

        assert!(f.assignment.assign(tenant, worker, site).await.unwrap().is_some());
        let err = f.assignment.assign(tenant, worker, site).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));

        // The second camera was never touched.
        assert!(f.store.get(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_worker_gets_none_when_site_is_exhausted() {
        let f = fixture(Duration::from_secs(90));
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let w1 = register(&f, tenant, "w1").await;
        let w2 = register(&f, tenant, "w2").await;
        let cam = camera(tenant, site, "entrance");
        f.store.add_camera(cam.clone()).await;

        assert!(f.assignment.assign(tenant, w1, site).await.unwrap().is_some());
        assert!(f.assignment.assign(tenant, w2, site).await.unwrap().is_none());

        // The held lease is untouched by the losing attempt.
        let lease = f.store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.generation, 1);
        assert_eq!(lease.worker_id, Some(w1));
    }

    #[tokio::test]
    async fn conflict_moves_to_next_candidate() {
        let f = fixture(Duration::from_secs(90));
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let w1 = register(&f, tenant, "w1").await;
        let w2 = register(&f, tenant, "w2").await;

        let mut first = camera(tenant, site, "entrance");
        first.created_at = Utc::now() - chrono::Duration::seconds(5);
        let second = camera(tenant, site, "checkout");
        f.store.add_camera(first.clone()).await;
        f.store.add_camera(second.clone()).await;

        assert_eq!(
            f.assignment
                .assign(tenant, w1, site)
                .await
                .unwrap()
                .map(|c| c.id),
            Some(first.id)
        );
        assert_eq!(
            f.assignment
                .assign(tenant, w2, site)
                .await
                .unwrap()
                .map(|c| c.id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn renewal_conflicts_on_stale_generation() {
        let f = fixture(Duration::from_secs(90));
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let worker = register(&f, tenant, "w1").await;
        let cam = camera(tenant, site, "entrance");
        f.store.add_camera(cam.clone()).await;
        f.assignment.assign(tenant, worker, site).await.unwrap();

        let ok = f.assignment.renew(worker, &[(cam.id, 1)]).await;
        assert_eq!(ok[0].status, RenewalStatus::Renewed);

        let stale = f.assignment.renew(worker, &[(cam.id, 0)]).await;
        assert_eq!(stale[0].status, RenewalStatus::Conflict);

        let unknown = f.assignment.renew(worker, &[(Uuid::new_v4(), 1)]).await;
        assert_eq!(unknown[0].status, RenewalStatus::Conflict);
    }

    #[tokio::test]
    async fn reclaim_frees_camera_for_another_worker() {
        let f = fixture(Duration::from_millis(20));
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let w1 = register(&f, tenant, "w1").await;
        let w2 = register(&f, tenant, "w2").await;
        let cam = camera(tenant, site, "entrance");
        f.store.add_camera(cam.clone()).await;

        f.assignment.assign(tenant, w1, site).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let count = f.assignment.reclaim_expired().await.unwrap();
        assert_eq!(count, 1);

        let lease = f.store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.state, LeaseState::Terminated);
        assert!(lease.worker_id.is_none());

        // Registry reconciled: w1 no longer shows the camera.
        let record = f.registry.get(w1).await.unwrap();
        assert!(record.camera_id.is_none());
        assert_eq!(record.status, WorkerStatus::Idle);

        // The camera is acquirable again with the next generation.
        let again = f.assignment.assign(tenant, w2, site).await.unwrap();
        assert_eq!(again.map(|c| c.id), Some(cam.id));
        assert_eq!(f.store.get(cam.id).await.unwrap().unwrap().generation, 2);
    }

    #[tokio::test]
    async fn release_for_worker_frees_all_held_leases() {
        let f = fixture(Duration::from_secs(90));
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let worker = register(&f, tenant, "w1").await;
        let cam = camera(tenant, site, "entrance");
        f.store.add_camera(cam.clone()).await;
        f.assignment.assign(tenant, worker, site).await.unwrap();

        let released = f
            .assignment
            .release_for_worker(worker, "connection closed")
            .await
            .unwrap();
        assert_eq!(released, 1);

        let lease = f.store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.state, LeaseState::Terminated);
        assert_eq!(lease.reason.as_deref(), Some("connection closed"));
    }
}
