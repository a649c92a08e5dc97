//! Response shapes shared by the REST handlers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::models::camera::Camera;
use crate::models::command::{CommandPriority, CommandStatus, CommandType, WorkerCommand};
use crate::models::lease::{CameraLease, LeaseState};
use crate::models::worker::{WorkerRecord, WorkerStatus};

/// Compact camera shape returned by assignment operations.
#[derive(Debug, Serialize)]
pub struct CameraSummary {
    pub id: Uuid,
    pub site_id: Uuid,
    pub name: String,
    pub source_url: String,
}

impl From<Camera> for CameraSummary {
    fn from(c: Camera) -> Self {
        Self {
            id: c.id,
            site_id: c.site_id,
            name: c.name,
            source_url: c.source_url,
        }
    }
}

/// Worker record plus computed health.
#[derive(Debug, Serialize)]
pub struct WorkerResponse {
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
    pub healthy: bool,
    pub uptime_secs: u64,
}

impl WorkerResponse {
    pub fn from_record(record: WorkerRecord, staleness: Duration) -> Self {
        let now = Utc::now();
        let healthy = record.is_healthy(staleness, now);
        let uptime_secs = record.uptime(staleness, now).as_secs();
        Self {
            id: record.id,
            tenant_id: record.tenant_id,
            hostname: record.hostname,
            address: record.address,
            name: record.name,
            version: record.version,
            site_id: record.site_id,
            capabilities: record.capabilities,
            status: record.status,
            camera_id: record.camera_id,
            last_heartbeat: record.last_heartbeat,
            last_error: record.last_error,
            error_count: record.error_count,
            processed_total: record.processed_total,
            registered_at: record.registered_at,
            healthy,
            uptime_secs,
        }
    }
}

/// Lease row plus computed expiry.
#[derive(Debug, Serialize)]
pub struct LeaseResponse {
    pub camera_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub generation: i64,
    pub state: LeaseState,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub expired: bool,
}

impl From<CameraLease> for LeaseResponse {
    fn from(lease: CameraLease) -> Self {
        let expired = lease.is_expired(Utc::now());
        Self {
            camera_id: lease.camera_id,
            tenant_id: lease.tenant_id,
            site_id: lease.site_id,
            worker_id: lease.worker_id,
            generation: lease.generation,
            state: lease.state,
            lease_expires_at: lease.lease_expires_at,
            reason: lease.reason,
            updated_at: lease.updated_at,
            expired,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub command_type: CommandType,
    pub parameters: HashMap<String, serde_json::Value>,
    pub priority: CommandPriority,
    pub status: CommandStatus,
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl From<WorkerCommand> for CommandResponse {
    fn from(c: WorkerCommand) -> Self {
        Self {
            id: c.id,
            worker_id: c.worker_id,
            command_type: c.command_type,
            parameters: c.parameters,
            priority: c.priority,
            status: c.status,
            requested_by: c.requested_by,
            created_at: c.created_at,
            expires_at: c.expires_at,
            retry_count: c.retry_count,
            max_retries: c.max_retries,
            result: c.result,
            error_message: c.error_message,
        }
    }
}
