//! Camera lease model (SQLx).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Camera lease state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "lease_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Pending,
    Active,
    Paused,
    Orphaned,
    Terminated,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Pending => write!(f, "pending"),
            LeaseState::Active => write!(f, "active"),
            LeaseState::Paused => write!(f, "paused"),
            LeaseState::Orphaned => write!(f, "orphaned"),
            LeaseState::Terminated => write!(f, "terminated"),
        }
    }
}

/// One row per camera recording its current delegation.
///
/// `generation` is the optimistic-concurrency token: it increments exactly
/// once per successful acquisition and never resets, so any writer that
/// presents a stale generation is rejected with zero rows affected.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CameraLease {
    pub camera_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub generation: i64,
    pub state: LeaseState,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CameraLease {
    /// A lease can be acquired when it has no holder or the holder's
    /// time has lapsed.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match (self.worker_id, self.lease_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires)) => expires < now,
            (Some(_), None) => false,
        }
    }

    /// An active lease whose expiry has passed, eligible for reclaim.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == LeaseState::Active
            && self.lease_expires_at.map(|e| e < now).unwrap_or(false)
    }
}
