//! Durable camera lease storage.
//!
//! The lease rows are the only state mutated concurrently by multiple
//! logical actors, so consistency is enforced here with conditional
//! writes rather than in-process locking: every mutation is guarded by
//! the generation the writer last observed, and zero rows affected
//! signals a conflict.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::models::camera::Camera;
use crate::models::lease::{CameraLease, LeaseState};

/// A lease terminated by the reclaim scan, with its prior holder.
#[derive(Debug, Clone)]
pub struct ReclaimedLease {
    pub camera_id: Uuid,
    pub worker_id: Option<Uuid>,
}

/// Lease storage backend trait.
///
/// All guarded operations return the number of rows affected; `0` means
/// the guard failed (stale generation, wrong holder, or an unavailable
/// lease) and the caller should move on rather than retry in place.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Fetch a lease row by camera.
    async fn get(&self, camera_id: Uuid) -> Result<Option<CameraLease>>;

    /// Fetch the lease for a camera, lazily creating a `pending`,
    /// generation-0 row on first contact.
    async fn get_or_create(&self, camera: &Camera) -> Result<CameraLease>;

    /// Acquire the lease for `worker_id`, guarded by the observed
    /// generation and availability.
    async fn try_acquire(
        &self,
        camera_id: Uuid,
        worker_id: Uuid,
        observed_generation: i64,
        ttl: Duration,
    ) -> Result<u64>;

    /// Extend the expiry of a held lease, guarded by holder and generation.
    async fn renew(
        &self,
        camera_id: Uuid,
        worker_id: Uuid,
        generation: i64,
        ttl: Duration,
    ) -> Result<u64>;

    /// Terminate a lease, guarded by the holder.
    async fn release(&self, camera_id: Uuid, worker_id: Uuid, reason: &str) -> Result<u64>;

    /// Terminate every active lease whose TTL has lapsed, returning the
    /// prior holders so registry state can be reconciled.
    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedLease>>;

    /// Active cameras for a tenant's site, in deterministic declaration order.
    async fn list_active_cameras(&self, tenant_id: Uuid, site_id: Uuid) -> Result<Vec<Camera>>;

    /// All lease rows, optionally filtered by tenant and/or holder.
    async fn list_leases(
        &self,
        tenant_id: Option<Uuid>,
        worker_id: Option<Uuid>,
    ) -> Result<Vec<CameraLease>>;
}

/// Postgres-backed lease store.
pub struct PgLeaseStore {
    db: PgPool,
}

impl PgLeaseStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn get(&self, camera_id: Uuid) -> Result<Option<CameraLease>> {
        let lease = sqlx::query_as::<_, CameraLease>(
            r#"
            SELECT camera_id, tenant_id, site_id, worker_id, generation,
                   state, lease_expires_at, reason, updated_at
            FROM camera_leases
            WHERE camera_id = $1
            "#,
        )
        .bind(camera_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(lease)
    }

    async fn get_or_create(&self, camera: &Camera) -> Result<CameraLease> {
        sqlx::query(
            r#"
            INSERT INTO camera_leases (camera_id, tenant_id, site_id, generation, state, updated_at)
            VALUES ($1, $2, $3, 0, 'pending', NOW())
            ON CONFLICT (camera_id) DO NOTHING
            "#,
        )
        .bind(camera.id)
        .bind(camera.tenant_id)
        .bind(camera.site_id)
        .execute(&self.db)
        .await?;

        let lease = sqlx::query_as::<_, CameraLease>(
            r#"
            SELECT camera_id, tenant_id, site_id, worker_id, generation,
                   state, lease_expires_at, reason, updated_at
            FROM camera_leases
            WHERE camera_id = $1
            "#,
        )
        .bind(camera.id)
        .fetch_one(&self.db)
        .await?;

        Ok(lease)
    }

    async fn try_acquire(
        &self,
        camera_id: Uuid,
        worker_id: Uuid,
        observed_generation: i64,
        ttl: Duration,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE camera_leases
            SET worker_id = $2,
                state = 'active',
                generation = generation + 1,
                lease_expires_at = NOW() + make_interval(secs => $4),
                reason = 'acquired',
                updated_at = NOW()
            WHERE camera_id = $1
              AND generation = $3
              AND (worker_id IS NULL OR lease_expires_at < NOW())
            "#,
        )
        .bind(camera_id)
        .bind(worker_id)
        .bind(observed_generation)
        .bind(ttl.as_secs_f64())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn renew(
        &self,
        camera_id: Uuid,
        worker_id: Uuid,
        generation: i64,
        ttl: Duration,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE camera_leases
            SET lease_expires_at = NOW() + make_interval(secs => $4),
                updated_at = NOW()
            WHERE camera_id = $1
              AND worker_id = $2
              AND generation = $3
              AND state = 'active'
            "#,
        )
        .bind(camera_id)
        .bind(worker_id)
        .bind(generation)
        .bind(ttl.as_secs_f64())
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release(&self, camera_id: Uuid, worker_id: Uuid, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE camera_leases
            SET state = 'terminated',
                worker_id = NULL,
                lease_expires_at = NULL,
                reason = $3,
                updated_at = NOW()
            WHERE camera_id = $1
              AND worker_id = $2
            "#,
        )
        .bind(camera_id)
        .bind(worker_id)
        .bind(reason)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedLease>> {
        let rows = sqlx::query_as::<_, (Uuid, Option<Uuid>)>(
            r#"
            WITH expired AS (
                SELECT camera_id, worker_id
                FROM camera_leases
                WHERE state = 'active' AND lease_expires_at < NOW()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE camera_leases cl
            SET state = 'terminated',
                worker_id = NULL,
                lease_expires_at = NULL,
                reason = 'lease expired',
                updated_at = NOW()
            FROM expired e
            WHERE cl.camera_id = e.camera_id
            RETURNING cl.camera_id, e.worker_id
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(camera_id, worker_id)| ReclaimedLease {
                camera_id,
                worker_id,
            })
            .collect())
    }

    async fn list_active_cameras(&self, tenant_id: Uuid, site_id: Uuid) -> Result<Vec<Camera>> {
        let cameras = sqlx::query_as::<_, Camera>(
            r#"
            SELECT id, tenant_id, site_id, name, source_url, is_active, created_at
            FROM cameras
            WHERE tenant_id = $1 AND site_id = $2 AND is_active = true
            ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id)
        .bind(site_id)
        .fetch_all(&self.db)
        .await?;

        Ok(cameras)
    }

    async fn list_leases(
        &self,
        tenant_id: Option<Uuid>,
        worker_id: Option<Uuid>,
    ) -> Result<Vec<CameraLease>> {
        let leases = sqlx::query_as::<_, CameraLease>(
            r#"
            SELECT camera_id, tenant_id, site_id, worker_id, generation,
                   state, lease_expires_at, reason, updated_at
            FROM camera_leases
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::uuid IS NULL OR worker_id = $2)
            ORDER BY updated_at DESC
            "#,
        )
        .bind(tenant_id)
        .bind(worker_id)
        .fetch_all(&self.db)
        .await?;

        Ok(leases)
    }
}

/// In-memory lease store.
///
/// Single-process backend with the same guarded-write semantics as the
/// Postgres store. Used by local development and the integration tests.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: RwLock<HashMap<Uuid, CameraLease>>,
    cameras: RwLock<Vec<Camera>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a camera to the in-memory catalog.
    pub async fn add_camera(&self, camera: Camera) {
        self.cameras.write().await.push(camera);
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, camera_id: Uuid) -> Result<Option<CameraLease>> {
        Ok(self.leases.read().await.get(&camera_id).cloned())
    }

    async fn get_or_create(&self, camera: &Camera) -> Result<CameraLease> {
        let mut leases = self.leases.write().await;
        let lease = leases.entry(camera.id).or_insert_with(|| CameraLease {
            camera_id: camera.id,
            tenant_id: camera.tenant_id,
            site_id: camera.site_id,
            worker_id: None,
            generation: 0,
            state: LeaseState::Pending,
            lease_expires_at: None,
            reason: None,
            updated_at: Utc::now(),
        });
        Ok(lease.clone())
    }

    async fn try_acquire(
        &self,
        camera_id: Uuid,
        worker_id: Uuid,
        observed_generation: i64,
        ttl: Duration,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        match leases.get_mut(&camera_id) {
            Some(lease)
                if lease.generation == observed_generation && lease.is_available(now) =>
            {
                lease.worker_id = Some(worker_id);
                lease.state = LeaseState::Active;
                lease.generation += 1;
                lease.lease_expires_at =
                    Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
                lease.reason = Some("acquired".into());
                lease.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn renew(
        &self,
        camera_id: Uuid,
        worker_id: Uuid,
        generation: i64,
        ttl: Duration,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        match leases.get_mut(&camera_id) {
            Some(lease)
                if lease.worker_id == Some(worker_id)
                    && lease.generation == generation
                    && lease.state == LeaseState::Active =>
            {
                lease.lease_expires_at =
                    Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
                lease.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn release(&self, camera_id: Uuid, worker_id: Uuid, reason: &str) -> Result<u64> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&camera_id) {
            Some(lease) if lease.worker_id == Some(worker_id) => {
                lease.state = LeaseState::Terminated;
                lease.worker_id = None;
                lease.lease_expires_at = None;
                lease.reason = Some(reason.into());
                lease.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn reclaim_expired(&self) -> Result<Vec<ReclaimedLease>> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        let mut reclaimed = Vec::new();
        for lease in leases.values_mut() {
            if lease.is_expired(now) {
                reclaimed.push(ReclaimedLease {
                    camera_id: lease.camera_id,
                    worker_id: lease.worker_id,
                });
                lease.state = LeaseState::Terminated;
                lease.worker_id = None;
                lease.lease_expires_at = None;
                lease.reason = Some("lease expired".into());
                lease.updated_at = now;
            }
        }
        Ok(reclaimed)
    }

    async fn list_active_cameras(&self, tenant_id: Uuid, site_id: Uuid) -> Result<Vec<Camera>> {
        let mut cameras: Vec<Camera> = self
            .cameras
            .read()
            .await
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.site_id == site_id && c.is_active)
            .cloned()
            .collect();
        cameras.sort_by_key(|c| (c.created_at, c.id));
        Ok(cameras)
    }

    async fn list_leases(
        &self,
        tenant_id: Option<Uuid>,
        worker_id: Option<Uuid>,
    ) -> Result<Vec<CameraLease>> {
        let leases = self.leases.read().await;
        let mut out: Vec<CameraLease> = leases
            .values()
            .filter(|l| {
                tenant_id.map(|t| l.tenant_id == t).unwrap_or(true)
                    && worker_id.map(|w| l.worker_id == Some(w)).unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(tenant: Uuid, site: Uuid) -> Camera {
        Camera {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            site_id: site,
            name: "entrance".into(),
            source_url: "rtsp://cam/entrance".into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn lazy_create_starts_pending_at_generation_zero() {
        let store = MemoryLeaseStore::new();
        let cam = camera(Uuid::new_v4(), Uuid::new_v4());

        let lease = store.get_or_create(&cam).await.unwrap();
        assert_eq!(lease.generation, 0);
        assert_eq!(lease.state, LeaseState::Pending);
        assert!(lease.worker_id.is_none());

        // Idempotent: second call returns the same row.
        let again = store.get_or_create(&cam).await.unwrap();
        assert_eq!(again.generation, 0);
    }

    #[tokio::test]
    async fn stale_generation_is_rejected() {
        let store = MemoryLeaseStore::new();
        let cam = camera(Uuid::new_v4(), Uuid::new_v4());
        store.get_or_create(&cam).await.unwrap();

        let w1 = Uuid::new_v4();
        let w2 = Uuid::new_v4();
        let ttl = Duration::from_secs(90);

        assert_eq!(store.try_acquire(cam.id, w1, 0, ttl).await.unwrap(), 1);
        // w2 still believes generation 0: zero rows affected.
        assert_eq!(store.try_acquire(cam.id, w2, 0, ttl).await.unwrap(), 0);

        let lease = store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.generation, 1);
        assert_eq!(lease.worker_id, Some(w1));
    }

    #[tokio::test]
    async fn renew_requires_matching_holder_and_generation() {
        let store = MemoryLeaseStore::new();
        let cam = camera(Uuid::new_v4(), Uuid::new_v4());
        store.get_or_create(&cam).await.unwrap();

        let w1 = Uuid::new_v4();
        let ttl = Duration::from_secs(90);
        store.try_acquire(cam.id, w1, 0, ttl).await.unwrap();

        assert_eq!(store.renew(cam.id, w1, 1, ttl).await.unwrap(), 1);
        // Renewing twice with the same pair is safe.
        assert_eq!(store.renew(cam.id, w1, 1, ttl).await.unwrap(), 1);
        // Wrong generation or wrong holder: conflict.
        assert_eq!(store.renew(cam.id, w1, 0, ttl).await.unwrap(), 0);
        assert_eq!(store.renew(cam.id, Uuid::new_v4(), 1, ttl).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_reacquirable() {
        let store = MemoryLeaseStore::new();
        let cam = camera(Uuid::new_v4(), Uuid::new_v4());
        store.get_or_create(&cam).await.unwrap();

        let w1 = Uuid::new_v4();
        store
            .try_acquire(cam.id, w1, 0, Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let reclaimed = store.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].worker_id, Some(w1));

        let lease = store.get(cam.id).await.unwrap().unwrap();
        assert_eq!(lease.state, LeaseState::Terminated);
        assert!(lease.worker_id.is_none());
        assert_eq!(lease.reason.as_deref(), Some("lease expired"));

        // A fresh generation chain starts from the incremented counter.
        let w2 = Uuid::new_v4();
        assert_eq!(
            store
                .try_acquire(cam.id, w2, 1, Duration::from_secs(90))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.get(cam.id).await.unwrap().unwrap().generation, 2);
    }

    #[tokio::test]
    async fn release_is_guarded_by_holder() {
        let store = MemoryLeaseStore::new();
        let cam = camera(Uuid::new_v4(), Uuid::new_v4());
        store.get_or_create(&cam).await.unwrap();

        let w1 = Uuid::new_v4();
        store
            .try_acquire(cam.id, w1, 0, Duration::from_secs(90))
            .await
            .unwrap();

        assert_eq!(
            store
                .release(cam.id, Uuid::new_v4(), "worker disconnected")
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .release(cam.id, w1, "worker disconnected")
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn camera_listing_is_deterministic_and_scoped() {
        let store = MemoryLeaseStore::new();
        let tenant = Uuid::new_v4();
        let site = Uuid::new_v4();

        let mut c1 = camera(tenant, site);
        c1.created_at = Utc::now() - chrono::Duration::seconds(10);
        let c2 = camera(tenant, site);
        let other = camera(Uuid::new_v4(), site);
        store.add_camera(c2.clone()).await;
        store.add_camera(c1.clone()).await;
        store.add_camera(other).await;

        let cams = store.list_active_cameras(tenant, site).await.unwrap();
        assert_eq!(cams.len(), 2);
        assert_eq!(cams[0].id, c1.id);
        assert_eq!(cams[1].id, c2.id);
    }
}
