//! Camera catalog model (SQLx).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A camera registered for a tenant's site.
///
/// Cameras are the shared resource the fleet leases out: at most one
/// worker holds a camera at a time, enforced through `camera_leases`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Camera {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub name: String,
    /// Stream source descriptor handed to the worker in a START command
    pub source_url: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
