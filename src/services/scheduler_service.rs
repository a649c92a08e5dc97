//! Background maintenance loops.
//!
//! Four independent loops keep the fleet state honest: lease reclaim,
//! stale-worker eviction, command expiry, and intent timeout. Each loop
//! ticks on its own interval, logs failures, and keeps running; a watch
//! channel lets the server stop them cleanly on shutdown.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::config::FleetTuning;
use crate::protocol::intent::IntentTracker;
use crate::services::assignment_service::AssignmentService;
use crate::services::command_service::CommandService;
use crate::services::metrics_service;
use crate::services::registry_service::WorkerRegistry;

/// Handle to the spawned maintenance loops.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every loop to stop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Spawn all maintenance loops and return a handle for shutdown.
pub fn spawn_all(
    tuning: FleetTuning,
    assignment: Arc<AssignmentService>,
    registry: Arc<WorkerRegistry>,
    commands: Arc<CommandService>,
    intents: Arc<IntentTracker>,
) -> SchedulerHandle {
    let (shutdown, _) = watch::channel(false);

    let tasks = vec![
        spawn_lease_reclaim(
            tuning.reclaim_interval,
            assignment.clone(),
            shutdown.subscribe(),
        ),
        spawn_registry_sweep(
            tuning.registry_sweep_interval,
            tuning.worker_ttl,
            registry,
            assignment,
            commands.clone(),
            intents.clone(),
            shutdown.subscribe(),
        ),
        spawn_command_sweep(tuning.command_sweep_interval, commands, shutdown.subscribe()),
        spawn_intent_sweep(
            tuning.intent_sweep_interval,
            tuning.intent_timeout,
            intents,
            shutdown.subscribe(),
        ),
    ];

    SchedulerHandle { shutdown, tasks }
}

/// Run one loop body on a fixed interval until shutdown is signalled.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    body: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        // Small startup delay so the server can finish initializing.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut tick = interval(period);
        loop {
            tokio::select! {
                _ = tick.tick() => body().await,
                _ = stop.changed() => {
                    tracing::debug!(loop_name = name, "Maintenance loop stopped");
                    return;
                }
            }
        }
    })
}

/// Terminate leases whose TTL has lapsed and free their cameras.
fn spawn_lease_reclaim(
    period: Duration,
    assignment: Arc<AssignmentService>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_loop("lease_reclaim", period, stop, move || {
        let assignment = assignment.clone();
        async move {
            match assignment.reclaim_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "Reclaimed expired leases"),
                Err(e) => tracing::error!("Lease reclaim failed: {e}"),
            }
        }
    })
}

/// Evict workers whose heartbeats stopped, releasing their leases and
/// dropping their queues.
fn spawn_registry_sweep(
    period: Duration,
    worker_ttl: Duration,
    registry: Arc<WorkerRegistry>,
    assignment: Arc<AssignmentService>,
    commands: Arc<CommandService>,
    intents: Arc<IntentTracker>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_loop("registry_sweep", period, stop, move || {
        let registry = registry.clone();
        let assignment = assignment.clone();
        let commands = commands.clone();
        let intents = intents.clone();
        async move {
            let evicted = registry.sweep_stale(worker_ttl).await;
            if evicted.is_empty() {
                return;
            }
            metrics_service::record_workers_evicted(evicted.len() as u64);
            for worker in evicted {
                tracing::warn!(
                    worker_id = %worker.id,
                    hostname = %worker.hostname,
                    "Evicted stale worker"
                );
                evict_worker(&assignment, &commands, &intents, worker.id).await;
            }
        }
    })
}

async fn evict_worker(
    assignment: &AssignmentService,
    commands: &CommandService,
    intents: &IntentTracker,
    worker_id: Uuid,
) {
    if let Err(e) = assignment
        .release_for_worker(worker_id, "worker evicted")
        .await
    {
        tracing::error!(%worker_id, "Failed to release leases for evicted worker: {e}");
    }
    commands.forget_worker(worker_id).await;
    intents.forget_worker(worker_id).await;
}

/// Finalize commands that sat in a queue past their expiry.
fn spawn_command_sweep(
    period: Duration,
    commands: Arc<CommandService>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_loop("command_sweep", period, stop, move || {
        let commands = commands.clone();
        async move {
            let expired = commands.sweep_expired().await;
            if expired > 0 {
                metrics_service::record_commands_expired(expired as u64);
                tracing::info!(count = expired, "Expired stale commands");
            }
        }
    })
}

/// Drop intents that never received an ACK.
fn spawn_intent_sweep(
    period: Duration,
    timeout: Duration,
    intents: Arc<IntentTracker>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_loop("intent_sweep", period, stop, move || {
        let intents = intents.clone();
        async move {
            let dropped = intents.sweep(timeout).await;
            if dropped.is_empty() {
                return;
            }
            metrics_service::record_intents_expired(dropped.len() as u64);
            for intent in dropped {
                tracing::warn!(
                    intent_id = %intent.id,
                    worker_id = %intent.worker_id,
                    message_type = %intent.message_type,
                    "Intent timed out without acknowledgement"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventBus;
    use crate::services::lease_store::{LeaseStore, MemoryLeaseStore};
    use crate::services::registry_service::RegisterWorkerRequest;
    use std::collections::HashMap;

    fn tight_tuning() -> FleetTuning {
        FleetTuning {
            lease_ttl: Duration::from_millis(20),
            reclaim_interval: Duration::from_millis(10),
            worker_ttl: Duration::from_millis(20),
            registry_sweep_interval: Duration::from_millis(10),
            heartbeat_staleness: Duration::from_millis(20),
            command_sweep_interval: Duration::from_millis(10),
            intent_timeout: Duration::from_millis(20),
            intent_sweep_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn loops_evict_stale_worker_and_release_lease() {
        let tuning = tight_tuning();
        let events = Arc::new(EventBus::new(64));
        let store = Arc::new(MemoryLeaseStore::new());
        let registry = Arc::new(WorkerRegistry::new(tuning.heartbeat_staleness, events.clone()));
        let commands = Arc::new(CommandService::new(events.clone()));
        let intents = Arc::new(IntentTracker::new());
        let assignment = Arc::new(AssignmentService::new(
            store.clone(),
            registry.clone(),
            commands.clone(),
            events,
            tuning.lease_ttl,
        ));

        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let worker = registry
            .register(RegisterWorkerRequest {
                tenant_id: tenant,
                hostname: "w1".into(),
                address: "10.0.0.5:9000".into(),
                name: "w1".into(),
                version: "1.0.0".into(),
                capabilities: HashMap::new(),
                site_id: Some(site),
            })
            .await
            .id;
        let cam = crate::models::camera::Camera {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            site_id: site,
            name: "entrance".into(),
            source_url: "rtsp://cams/entrance".into(),
            is_active: true,
            created_at: chrono::Utc::now(),
        };
        store.add_camera(cam.clone()).await;
        assignment.assign(tenant, worker, site).await.unwrap();

        let handle = spawn_all(
            tuning,
            assignment,
            registry.clone(),
            commands.clone(),
            intents,
        );

        // Startup delay plus a few ticks.
        tokio::time::sleep(Duration::from_millis(700)).await;
        handle.shutdown().await;

        assert!(registry.get(worker).await.is_none());
        let lease = store.get(cam.id).await.unwrap().unwrap();
        assert!(lease.worker_id.is_none());
        assert!(commands.pending_for(worker).await.is_empty());
    }
}
