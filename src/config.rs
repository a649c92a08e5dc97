//! Application configuration loaded from environment variables.

use crate::error::{AppError, Result};
use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Log level
    pub log_level: String,

    /// Orchestration timing knobs
    pub tuning: FleetTuning,
}

/// TTLs and loop intervals for the orchestration core.
///
/// Defaults match production; tests construct shrunken values so that
/// expiry paths run in milliseconds instead of minutes.
#[derive(Debug, Clone)]
pub struct FleetTuning {
    /// How long an acquired camera lease is valid without renewal
    pub lease_ttl: Duration,
    /// Interval of the expired-lease reclaim loop
    pub reclaim_interval: Duration,
    /// Heartbeat age beyond which a worker record is evicted
    pub worker_ttl: Duration,
    /// Interval of the stale-worker sweep loop
    pub registry_sweep_interval: Duration,
    /// Heartbeat age beyond which a worker is no longer considered healthy
    pub heartbeat_staleness: Duration,
    /// Interval of the command expiry sweep loop
    pub command_sweep_interval: Duration,
    /// Age past which an unacknowledged intent is dropped
    pub intent_timeout: Duration,
    /// Interval of the intent sweep loop
    pub intent_sweep_interval: Duration,
}

impl Default for FleetTuning {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(90),
            reclaim_interval: Duration::from_secs(30),
            worker_ttl: Duration::from_secs(300),
            registry_sweep_interval: Duration::from_secs(60),
            heartbeat_staleness: Duration::from_secs(120),
            command_sweep_interval: Duration::from_secs(60),
            intent_timeout: Duration::from_secs(120),
            intent_sweep_interval: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            tuning: FleetTuning {
                lease_ttl: env_secs("LEASE_TTL_SECS", 90),
                reclaim_interval: env_secs("LEASE_RECLAIM_INTERVAL_SECS", 30),
                worker_ttl: env_secs("WORKER_TTL_SECS", 300),
                registry_sweep_interval: env_secs("REGISTRY_SWEEP_INTERVAL_SECS", 60),
                heartbeat_staleness: env_secs("HEARTBEAT_STALENESS_SECS", 120),
                command_sweep_interval: env_secs("COMMAND_SWEEP_INTERVAL_SECS", 60),
                intent_timeout: env_secs("INTENT_TIMEOUT_SECS", 120),
                intent_sweep_interval: env_secs("INTENT_SWEEP_INTERVAL_SECS", 120),
            },
        })
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
