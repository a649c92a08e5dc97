//! Worker command model (in-memory, owned by the command service).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Kind of directive sent to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Start,
    Stop,
    Reload,
    Drain,
    AssignCamera,
    ReleaseCamera,
}

impl CommandType {
    /// Wire name used in intent tracking and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Start => "start",
            CommandType::Stop => "stop",
            CommandType::Reload => "reload",
            CommandType::Drain => "drain",
            CommandType::AssignCamera => "assign_camera",
            CommandType::ReleaseCamera => "release_camera",
        }
    }
}

/// Dispatch priority; also determines the default expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl CommandPriority {
    /// Default time budget before an undelivered command expires.
    pub fn default_timeout(self) -> Duration {
        match self {
            CommandPriority::Urgent => Duration::from_secs(60),
            _ => Duration::from_secs(300),
        }
    }
}

/// Command lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl CommandStatus {
    /// Terminal statuses move the command out of the queue into history.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Expired
                | CommandStatus::Cancelled
        )
    }
}

/// A server-to-worker directive with its own expiry and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommand {
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

impl WorkerCommand {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Retry is a deliberate caller action, allowed only while the retry
    /// budget holds and the command has not aged out.
    pub fn can_retry(&self, now: DateTime<Utc>) -> bool {
        self.retry_count < self.max_retries && !self.is_expired(now)
    }
}
