//! Camera Fleet Orchestration - Backend Library
//!
//! Worker registry, camera lease store, assignment service, command
//! queues, and the persistent worker connection protocol.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
