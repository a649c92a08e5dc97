//! Domain models.

pub mod camera;
pub mod command;
pub mod lease;
pub mod worker;
