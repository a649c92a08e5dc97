//! Persistent worker connection handling.
//!
//! The transport (WebSocket) lives in the API layer; this module owns the
//! per-connection session logic: registration, heartbeats with embedded
//! lease renewals, intent-correlated acknowledgements, camera event
//! ingestion, and command dispatch. Keeping it transport-free means the
//! whole protocol is testable without opening a socket.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::command::{CommandType, WorkerCommand};
use crate::models::worker::WorkerStatus;
use crate::protocol::intent::IntentTracker;
use crate::protocol::message::{
    AckStatus, Envelope, LeaseRenewal, ServerMessage, WorkerMessage,
};
use crate::services::assignment_service::AssignmentService;
use crate::services::command_service::CommandService;
use crate::services::event_bus::{EventBus, FleetEvent};
use crate::services::metrics_service;
use crate::services::registry_service::{
    HeartbeatUpdate, RegisterWorkerRequest, WorkerRegistry,
};

/// Outbound channel capacity per connection. A worker that cannot drain
/// this many frames is effectively dead and will be disconnected.
const OUTBOUND_BUFFER: usize = 64;

/// Table of live worker connections.
#[derive(Default)]
pub struct ConnectionManager {
    senders: RwLock<HashMap<Uuid, mpsc::Sender<Envelope<ServerMessage>>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection, returning the receiving half for the socket
    /// writer task. A second connection for the same worker replaces the
    /// first; the stale socket's sends start failing.
    pub async fn attach(&self, worker_id: Uuid) -> mpsc::Receiver<Envelope<ServerMessage>> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let mut senders = self.senders.write().await;
        if senders.insert(worker_id, tx).is_some() {
            tracing::warn!(%worker_id, "Replaced an existing connection for worker");
        }
        metrics_service::set_connected_workers(senders.len());
        rx
    }

    pub async fn detach(&self, worker_id: Uuid) {
        let mut senders = self.senders.write().await;
        senders.remove(&worker_id);
        metrics_service::set_connected_workers(senders.len());
    }

    /// Send a frame to a connected worker. Returns false when the worker
    /// has no live connection or its outbound buffer is full.
    pub async fn send(&self, worker_id: Uuid, message: Envelope<ServerMessage>) -> bool {
        let senders = self.senders.read().await;
        match senders.get(&worker_id) {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }

    pub async fn is_connected(&self, worker_id: Uuid) -> bool {
        self.senders.read().await.contains_key(&worker_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

/// Per-connection state kept by the socket task.
#[derive(Default)]
pub struct SessionState {
    /// Worker id once the session has registered.
    pub worker_id: Option<Uuid>,
    /// Highest event seq observed per `(camera_id, generation)`.
    last_seq: HashMap<(Uuid, i64), i64>,
}

/// Session-level protocol handler shared by every connection.
pub struct FleetProtocol {
    registry: Arc<WorkerRegistry>,
    assignment: Arc<AssignmentService>,
    commands: Arc<CommandService>,
    intents: Arc<IntentTracker>,
    connections: Arc<ConnectionManager>,
    events: Arc<EventBus>,
}

impl FleetProtocol {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        assignment: Arc<AssignmentService>,
        commands: Arc<CommandService>,
        intents: Arc<IntentTracker>,
        connections: Arc<ConnectionManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            assignment,
            commands,
            intents,
            connections,
            events,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Process one inbound frame, returning the frames to send back on
    /// this connection.
    pub async fn handle_message(
        &self,
        session: &mut SessionState,
        message: Envelope<WorkerMessage>,
    ) -> Vec<Envelope<ServerMessage>> {
        match message.body {
            WorkerMessage::Register {
                tenant_id,
                hostname,
                address,
                name,
                version,
                capabilities,
                site_id,
            } => {
                let record = self
                    .registry
                    .register(RegisterWorkerRequest {
                        tenant_id,
                        hostname,
                        address,
                        name,
                        version,
                        capabilities,
                        site_id,
                    })
                    .await;
                session.worker_id = Some(record.id);
                let mut replies = vec![Envelope::new(ServerMessage::Registered {
                    worker_id: record.id,
                })];
                // A site in the registration is a request for work: try one
                // assignment and ride the start command along.
                if let Some(site_id) = site_id {
                    match self.assignment.assign(tenant_id, record.id, site_id).await {
                        Ok(Some(camera)) => tracing::info!(
                            worker_id = %record.id,
                            camera_id = %camera.id,
                            "Camera auto-assigned at registration"
                        ),
                        Ok(None) => {}
                        Err(e) => tracing::warn!(
                            worker_id = %record.id,
                            "Auto-assignment at registration failed: {e}"
                        ),
                    }
                    replies.extend(self.dispatch_pending(record.id).await);
                }
                replies
            }
            WorkerMessage::Heartbeat {
                worker_id,
                status,
                processed_delta,
                error,
                capabilities,
                current_camera_id,
                renewals,
            } => {
                self.handle_heartbeat(
                    session,
                    worker_id,
                    HeartbeatUpdate {
                        status,
                        processed_delta,
                        error,
                        capabilities,
                        current_camera_id,
                    },
                    &renewals,
                )
                .await
            }
            WorkerMessage::Ack {
                intent_id,
                status,
                detail,
            } => {
                self.handle_ack(intent_id, status, detail).await;
                Vec::new()
            }
            WorkerMessage::Event {
                worker_id,
                camera_id,
                generation,
                seq,
                event_type,
                payload,
            } => {
                self.handle_event(
                    session, worker_id, camera_id, generation, seq, &event_type, payload,
                )
                .await;
                Vec::new()
            }
        }
    }

    async fn handle_heartbeat(
        &self,
        session: &mut SessionState,
        worker_id: Uuid,
        update: HeartbeatUpdate,
        renewals: &[LeaseRenewal],
    ) -> Vec<Envelope<ServerMessage>> {
        let going_offline = update.status == WorkerStatus::Offline;
        if self.registry.heartbeat(worker_id, update).await.is_none() {
            // Evicted or never registered; the worker must re-register.
            return vec![Envelope::new(ServerMessage::Error {
                message: format!("Worker {worker_id} is not registered"),
            })];
        }
        session.worker_id.get_or_insert(worker_id);

        // An offline transition releases the durable leases too; the
        // registry only clears its own cross-reference.
        if going_offline {
            if let Err(e) = self
                .assignment
                .release_for_worker(worker_id, "worker offline")
                .await
            {
                tracing::error!(%worker_id, "Failed to release leases for offline worker: {e}");
            }
        }

        let pairs: Vec<(Uuid, i64)> = renewals
            .iter()
            .map(|r| (r.camera_id, r.generation))
            .collect();
        let results = self.assignment.renew(worker_id, &pairs).await;
        let mut replies = vec![Envelope::new(ServerMessage::HeartbeatAck {
            worker_id,
            renewals: results,
        })];
        // No dispatch to a worker that just told us it is going away.
        if !going_offline {
            replies.extend(self.dispatch_pending(worker_id).await);
        }
        replies
    }

    /// Resolve an ACK against its intent and drive the command lifecycle.
    async fn handle_ack(&self, intent_id: Uuid, status: AckStatus, detail: Option<String>) {
        let Some(intent) = self.intents.resolve(intent_id).await else {
            // Late or duplicate ACK after the sweep dropped the intent.
            tracing::debug!(%intent_id, "ACK for unknown intent dropped");
            return;
        };
        let Some(command_id) = intent.correlation_id else {
            return;
        };

        let outcome = match status {
            AckStatus::Processing => {
                self.commands.acknowledge(command_id, intent.worker_id).await
            }
            AckStatus::Success => {
                self.commands
                    .complete(
                        command_id,
                        intent.worker_id,
                        detail.map(|d| serde_json::json!({ "detail": d })),
                        None,
                    )
                    .await
            }
            AckStatus::Error => {
                self.commands
                    .complete(
                        command_id,
                        intent.worker_id,
                        None,
                        Some(detail.unwrap_or_else(|| "worker reported failure".into())),
                    )
                    .await
            }
        };
        match outcome {
            Ok(_) => {}
            // Cancelled or expired while in flight; nothing to do.
            Err(AppError::NotFound(_)) | Err(AppError::Conflict(_)) => {
                tracing::debug!(%command_id, "ACK for finalized command dropped");
            }
            Err(e) => {
                tracing::error!(%command_id, "Failed to apply ACK: {e}");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_event(
        &self,
        session: &mut SessionState,
        worker_id: Uuid,
        camera_id: Uuid,
        generation: i64,
        seq: i64,
        event_type: &str,
        payload: serde_json::Value,
    ) {
        let key = (camera_id, generation);
        if let Some(&last) = session.last_seq.get(&key) {
            if seq <= last {
                tracing::warn!(
                    %worker_id,
                    %camera_id,
                    generation,
                    seq,
                    last,
                    "Out-of-order camera event dropped"
                );
                return;
            }
        }
        session.last_seq.insert(key, seq);

        self.events.publish(FleetEvent::now(
            event_type,
            Some(worker_id),
            Some(camera_id),
            serde_json::to_string(&payload).ok(),
        ));
    }

    /// Drain the pending queue into intent-tracked server frames.
    pub async fn dispatch_pending(&self, worker_id: Uuid) -> Vec<Envelope<ServerMessage>> {
        let mut frames = Vec::new();
        while let Some(command) = self.commands.next_to_send(worker_id).await {
            let intent_id = self
                .intents
                .track(
                    worker_id,
                    command.command_type.as_str(),
                    Some(command.id),
                    serde_json::to_value(&command.parameters).unwrap_or_default(),
                )
                .await;
            frames.push(Envelope::correlated(
                server_frame(&command, intent_id),
                command.id,
            ));
        }
        frames
    }

    /// Mark a worker gone: offline status, leases released, queues kept
    /// (commands survive a reconnect), intents dropped.
    pub async fn handle_disconnect(&self, session: &SessionState) {
        let Some(worker_id) = session.worker_id else {
            return;
        };
        self.connections.detach(worker_id).await;
        self.registry.mark_offline(worker_id).await;
        if let Err(e) = self
            .assignment
            .release_for_worker(worker_id, "connection closed")
            .await
        {
            tracing::error!(%worker_id, "Failed to release leases on disconnect: {e}");
        }
        self.intents.forget_worker(worker_id).await;
        tracing::info!(%worker_id, "Worker disconnected");
    }
}

/// Build the wire frame for a queued command.
fn server_frame(command: &WorkerCommand, intent_id: Uuid) -> ServerMessage {
    let parameters = command.parameters.clone();
    match command.command_type {
        CommandType::Start => ServerMessage::Start {
            intent_id,
            command_id: command.id,
            camera_id: parameters
                .get("camera_id")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            generation: parameters.get("generation").and_then(|v| v.as_i64()),
            source_url: parameters
                .get("source_url")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            parameters,
        },
        CommandType::Stop => ServerMessage::Stop {
            intent_id,
            command_id: command.id,
            parameters,
        },
        CommandType::Reload => ServerMessage::Reload {
            intent_id,
            command_id: command.id,
            parameters,
        },
        CommandType::Drain => ServerMessage::Drain {
            intent_id,
            command_id: command.id,
            parameters,
        },
        CommandType::AssignCamera => ServerMessage::AssignCamera {
            intent_id,
            command_id: command.id,
            parameters,
        },
        CommandType::ReleaseCamera => ServerMessage::ReleaseCamera {
            intent_id,
            command_id: command.id,
            parameters,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::command::{CommandPriority, CommandStatus};
    use crate::models::lease::LeaseState;
    use crate::services::assignment_service::RenewalStatus;
    use crate::services::command_service::SendCommandRequest;
    use crate::services::lease_store::{LeaseStore, MemoryLeaseStore};
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryLeaseStore>,
        registry: Arc<WorkerRegistry>,
        commands: Arc<CommandService>,
        intents: Arc<IntentTracker>,
        protocol: FleetProtocol,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(EventBus::new(64));
        let store = Arc::new(MemoryLeaseStore::new());
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(120), events.clone()));
        let commands = Arc::new(CommandService::new(events.clone()));
        let intents = Arc::new(IntentTracker::new());
        let assignment = Arc::new(AssignmentService::new(
            store.clone(),
            registry.clone(),
            commands.clone(),
            events.clone(),
            Duration::from_secs(90),
        ));
        let protocol = FleetProtocol::new(
            registry.clone(),
            assignment,
            commands.clone(),
            intents.clone(),
            Arc::new(ConnectionManager::new()),
            events,
        );
        Fixture {
            store,
            registry,
            commands,
            intents,
            protocol,
        }
    }

    fn register_frame(tenant: Uuid) -> Envelope<WorkerMessage> {
        Envelope::new(WorkerMessage::Register {
            tenant_id: tenant,
            hostname: "w1".into(),
            address: "10.0.0.5:9000".into(),
            name: "w1".into(),
            version: "1.0.0".into(),
            capabilities: HashMap::new(),
            site_id: None,
        })
    }

    async fn registered_session(f: &Fixture, tenant: Uuid) -> (SessionState, Uuid) {
        let mut session = SessionState::default();
        let replies = f
            .protocol
            .handle_message(&mut session, register_frame(tenant))
            .await;
        let worker_id = match replies[0].body {
            ServerMessage::Registered { worker_id } => worker_id,
            ref other => panic!("expected registered frame, got {other:?}"),
        };
        (session, worker_id)
    }

    #[tokio::test]
    async fn register_binds_session_and_replies_with_id() {
        let f = fixture();
        let (session, worker_id) = registered_session(&f, Uuid::new_v4()).await;
        assert_eq!(session.worker_id, Some(worker_id));
        assert!(f.registry.get(worker_id).await.is_some());
    }

    #[tokio::test]
    async fn register_with_site_auto_assigns_and_dispatches_start() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let cam = crate::models::camera::Camera {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            site_id: site,
            name: "entrance".into(),
            source_url: "rtsp://cams/entrance".into(),
            is_active: true,
            created_at: Utc::now(),
        };
        f.store.add_camera(cam.clone()).await;

        let mut session = SessionState::default();
        let replies = f
            .protocol
            .handle_message(
                &mut session,
                Envelope::new(WorkerMessage::Register {
                    tenant_id: tenant,
                    hostname: "w1".into(),
                    address: "10.0.0.5:9000".into(),
                    name: "w1".into(),
                    version: "1.0.0".into(),
                    capabilities: HashMap::new(),
                    site_id: Some(site),
                }),
            )
            .await;
        let worker_id = match replies[0].body {
            ServerMessage::Registered { worker_id } => worker_id,
            ref other => panic!("expected registered frame, got {other:?}"),
        };

        // The lease was acquired and the start command rides along.
        let lease = f.store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.worker_id, Some(worker_id));
        assert_eq!(lease.generation, 1);
        assert!(replies
            .iter()
            .any(|r| matches!(r.body, ServerMessage::Start { .. })));
        assert_eq!(f.intents.len().await, 1);
    }

    #[tokio::test]
    async fn offline_heartbeat_releases_durable_lease() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let (mut session, worker_id) = registered_session(&f, tenant).await;
        let cam = crate::models::camera::Camera {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            site_id: site,
            name: "entrance".into(),
            source_url: "rtsp://cams/entrance".into(),
            is_active: true,
            created_at: Utc::now(),
        };
        f.store.add_camera(cam.clone()).await;
        f.protocol
            .assignment
            .assign(tenant, worker_id, site)
            .await
            .unwrap();

        let replies = f
            .protocol
            .handle_message(
                &mut session,
                Envelope::new(WorkerMessage::Heartbeat {
                    worker_id,
                    status: WorkerStatus::Offline,
                    processed_delta: 0,
                    error: None,
                    capabilities: None,
                    current_camera_id: None,
                    renewals: vec![],
                }),
            )
            .await;
        assert!(matches!(replies[0].body, ServerMessage::HeartbeatAck { .. }));

        // Registry and lease store agree: no holder anywhere.
        let lease = f.store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.state, LeaseState::Terminated);
        assert!(lease.worker_id.is_none());
        assert_eq!(lease.reason.as_deref(), Some("worker offline"));
        let record = f.registry.get(worker_id).await.unwrap();
        assert_eq!(record.status, WorkerStatus::Offline);
        assert!(record.camera_id.is_none());
    }

    #[tokio::test]
    async fn heartbeat_from_unregistered_worker_gets_error_frame() {
        let f = fixture();
        let mut session = SessionState::default();
        let replies = f
            .protocol
            .handle_message(
                &mut session,
                Envelope::new(WorkerMessage::Heartbeat {
                    worker_id: Uuid::new_v4(),
                    status: WorkerStatus::Idle,
                    processed_delta: 0,
                    error: None,
                    capabilities: None,
                    current_camera_id: None,
                    renewals: vec![],
                }),
            )
            .await;
        assert!(matches!(replies[0].body, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn heartbeat_renews_lease_and_flushes_queue() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let (mut session, worker_id) = registered_session(&f, tenant).await;

        let cam = crate::models::camera::Camera {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            site_id: site,
            name: "entrance".into(),
            source_url: "rtsp://cams/entrance".into(),
            is_active: true,
            created_at: Utc::now(),
        };
        f.store.add_camera(cam.clone()).await;
        f.protocol
            .assignment
            .assign(tenant, worker_id, site)
            .await
            .unwrap();

        let replies = f
            .protocol
            .handle_message(
                &mut session,
                Envelope::new(WorkerMessage::Heartbeat {
                    worker_id,
                    status: WorkerStatus::Processing,
                    processed_delta: 12,
                    error: None,
                    capabilities: None,
                    current_camera_id: Some(cam.id),
                    renewals: vec![LeaseRenewal {
                        camera_id: cam.id,
                        generation: 1,
                    }],
                }),
            )
            .await;

        match &replies[0].body {
            ServerMessage::HeartbeatAck { renewals, .. } => {
                assert_eq!(renewals.len(), 1);
                assert_eq!(renewals[0].status, RenewalStatus::Renewed);
            }
            other => panic!("expected heartbeat ack, got {other:?}"),
        }
        // The queued start command rides along as an intent-tracked frame.
        assert!(replies
            .iter()
            .any(|r| matches!(r.body, ServerMessage::Start { .. })));
        assert_eq!(f.intents.len().await, 1);
    }

    #[tokio::test]
    async fn ack_lifecycle_drives_command_status() {
        let f = fixture();
        let (_, worker_id) = registered_session(&f, Uuid::new_v4()).await;
        let command = f
            .commands
            .send(SendCommandRequest {
                worker_id,
                command_type: CommandType::Reload,
                parameters: HashMap::new(),
                priority: CommandPriority::Normal,
                requested_by: None,
                timeout_override: None,
            })
            .await;

        let frames = f.protocol.dispatch_pending(worker_id).await;
        let intent_id = match frames[0].body {
            ServerMessage::Reload { intent_id, .. } => intent_id,
            ref other => panic!("expected reload frame, got {other:?}"),
        };

        f.protocol
            .handle_ack(intent_id, AckStatus::Processing, None)
            .await;
        // Processing resolves the intent; completion arrives out of band
        // through the REST complete endpoint or a later tracked frame.
        assert_eq!(
            f.commands.get(command.id).await.unwrap().status,
            CommandStatus::Acknowledged
        );
        assert!(f.intents.resolve(intent_id).await.is_none());
    }

    #[tokio::test]
    async fn error_ack_fails_the_command() {
        let f = fixture();
        let (_, worker_id) = registered_session(&f, Uuid::new_v4()).await;
        let command = f
            .commands
            .send(SendCommandRequest {
                worker_id,
                command_type: CommandType::Stop,
                parameters: HashMap::new(),
                priority: CommandPriority::Urgent,
                requested_by: None,
                timeout_override: None,
            })
            .await;

        let frames = f.protocol.dispatch_pending(worker_id).await;
        let intent_id = match frames[0].body {
            ServerMessage::Stop { intent_id, .. } => intent_id,
            ref other => panic!("expected stop frame, got {other:?}"),
        };

        f.protocol
            .handle_ack(intent_id, AckStatus::Error, Some("pipeline crashed".into()))
            .await;
        let finalized = f.commands.get(command.id).await.unwrap();
        assert_eq!(finalized.status, CommandStatus::Failed);
        assert_eq!(finalized.error_message.as_deref(), Some("pipeline crashed"));
    }

    #[tokio::test]
    async fn late_ack_after_sweep_is_ignored() {
        let f = fixture();
        let (_, worker_id) = registered_session(&f, Uuid::new_v4()).await;
        f.commands
            .send(SendCommandRequest {
                worker_id,
                command_type: CommandType::Drain,
                parameters: HashMap::new(),
                priority: CommandPriority::Normal,
                requested_by: None,
                timeout_override: None,
            })
            .await;
        let frames = f.protocol.dispatch_pending(worker_id).await;
        let intent_id = match frames[0].body {
            ServerMessage::Drain { intent_id, .. } => intent_id,
            ref other => panic!("expected drain frame, got {other:?}"),
        };
        f.intents.sweep(Duration::ZERO).await;

        // Must not panic or resurrect anything.
        f.protocol
            .handle_ack(intent_id, AckStatus::Success, None)
            .await;
        assert_eq!(f.intents.len().await, 0);
    }

    #[tokio::test]
    async fn out_of_order_event_is_dropped() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let (mut session, worker_id) = registered_session(&f, tenant).await;
        let camera_id = Uuid::new_v4();
        let mut rx = f.protocol.events.subscribe();

        for seq in [1, 2, 2, 1] {
            f.protocol
                .handle_message(
                    &mut session,
                    Envelope::new(WorkerMessage::Event {
                        worker_id,
                        camera_id,
                        generation: 1,
                        seq,
                        event_type: "camera.frame_gap".into(),
                        payload: serde_json::json!({}),
                    }),
                )
                .await;
        }
        assert_eq!(rx.recv().await.unwrap().event_type, "camera.frame_gap");
        assert_eq!(rx.recv().await.unwrap().event_type, "camera.frame_gap");
        assert!(rx.try_recv().is_err());

        // A new generation starts its own sequence.
        f.protocol
            .handle_message(
                &mut session,
                Envelope::new(WorkerMessage::Event {
                    worker_id,
                    camera_id,
                    generation: 2,
                    seq: 1,
                    event_type: "camera.frame_gap".into(),
                    payload: serde_json::json!({}),
                }),
            )
            .await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn disconnect_releases_leases_and_marks_offline() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();
        let (mut session, worker_id) = registered_session(&f, tenant).await;
        session.worker_id = Some(worker_id);

        let cam = crate::models::camera::Camera {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            site_id: site,
            name: "entrance".into(),
            source_url: "rtsp://cams/entrance".into(),
            is_active: true,
            created_at: Utc::now(),
        };
        f.store.add_camera(cam.clone()).await;
        f.protocol
            .assignment
            .assign(tenant, worker_id, site)
            .await
            .unwrap();

        f.protocol.handle_disconnect(&session).await;

        let record = f.registry.get(worker_id).await;
        assert!(record.is_none() || record.unwrap().status == WorkerStatus::Offline);
        let lease = f.store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.state, LeaseState::Terminated);
        assert!(lease.worker_id.is_none());
    }

    #[tokio::test]
    async fn connection_manager_tracks_attachment() {
        let manager = ConnectionManager::new();
        let worker = Uuid::new_v4();
        let mut rx = manager.attach(worker).await;
        assert!(manager.is_connected(worker).await);

        assert!(
            manager
                .send(worker, Envelope::new(ServerMessage::Registered { worker_id: worker }))
                .await
        );
        assert!(matches!(
            rx.recv().await.unwrap().body,
            ServerMessage::Registered { .. }
        ));

        manager.detach(worker).await;
        assert!(!manager.is_connected(worker).await);
        assert!(
            !manager
                .send(worker, Envelope::new(ServerMessage::Registered { worker_id: worker }))
                .await
        );
    }
}
