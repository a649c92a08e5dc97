//! Worker connection protocol: wire messages, intent tracking, and
//! session handling.

pub mod connection;
pub mod intent;
pub mod message;
