//! Service layer.

pub mod assignment_service;
pub mod command_service;
pub mod event_bus;
pub mod lease_store;
pub mod metrics_service;
pub mod registry_service;
pub mod scheduler_service;
