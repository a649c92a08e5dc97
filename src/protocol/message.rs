//! Typed messages for the worker connection protocol.
//!
//! Every frame is JSON with a `type` tag, a `timestamp`, and an optional
//! `correlation_id`, plus kind-specific fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::worker::WorkerStatus;

/// Frame envelope wrapping a tagged message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: None,
            body,
        }
    }

    pub fn correlated(body: T, correlation_id: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: Some(correlation_id),
            body,
        }
    }
}

/// Acknowledgement outcome reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
    Processing,
}

/// A lease renewal embedded in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRenewal {
    pub camera_id: Uuid,
    pub generation: i64,
}

/// Messages sent by a worker to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        tenant_id: Uuid,
        hostname: String,
        address: String,
        name: String,
        version: String,
        #[serde(default)]
        capabilities: HashMap<String, serde_json::Value>,
        #[serde(default)]
        site_id: Option<Uuid>,
    },
    Heartbeat {
        worker_id: Uuid,
        status: WorkerStatus,
        #[serde(default)]
        processed_delta: u64,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        capabilities: Option<HashMap<String, serde_json::Value>>,
        #[serde(default)]
        current_camera_id: Option<Uuid>,
        #[serde(default)]
        renewals: Vec<LeaseRenewal>,
    },
    Ack {
        intent_id: Uuid,
        status: AckStatus,
        #[serde(default)]
        detail: Option<String>,
    },
    Event {
        worker_id: Uuid,
        camera_id: Uuid,
        generation: i64,
        /// Monotonic per `(camera_id, generation)` pair.
        seq: i64,
        event_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// Messages sent by the server to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Issued after a successful in-band registration so the worker
    /// learns its id.
    Registered { worker_id: Uuid },
    Start {
        intent_id: Uuid,
        command_id: Uuid,
        camera_id: Option<Uuid>,
        generation: Option<i64>,
        source_url: Option<String>,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    Stop {
        intent_id: Uuid,
        command_id: Uuid,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    Reload {
        intent_id: Uuid,
        command_id: Uuid,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    Drain {
        intent_id: Uuid,
        command_id: Uuid,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    AssignCamera {
        intent_id: Uuid,
        command_id: Uuid,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    ReleaseCamera {
        intent_id: Uuid,
        command_id: Uuid,
        #[serde(default)]
        parameters: HashMap<String, serde_json::Value>,
    },
    /// Per-item results for renewals embedded in a heartbeat.
    HeartbeatAck {
        worker_id: Uuid,
        renewals: Vec<crate::services::assignment_service::RenewalResult>,
    },
    /// Generic error frame for malformed input; the connection stays open.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_message_carries_type_tag() {
        let msg = Envelope::new(WorkerMessage::Ack {
            intent_id: Uuid::new_v4(),
            status: AckStatus::Success,
            detail: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["status"], "success");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn heartbeat_defaults_are_lenient() {
        // A minimal heartbeat parses without optional fields.
        let raw = serde_json::json!({
            "type": "heartbeat",
            "timestamp": "2026-03-01T12:00:00Z",
            "worker_id": Uuid::new_v4(),
            "status": "processing"
        });
        let parsed: Envelope<WorkerMessage> = serde_json::from_value(raw).unwrap();
        match parsed.body {
            WorkerMessage::Heartbeat {
                processed_delta,
                renewals,
                ..
            } => {
                assert_eq!(processed_delta, 0);
                assert!(renewals.is_empty());
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = serde_json::json!({
            "type": "selfdestruct",
            "timestamp": "2026-03-01T12:00:00Z"
        });
        assert!(serde_json::from_value::<Envelope<WorkerMessage>>(raw).is_err());
    }

    #[test]
    fn server_start_round_trips_assignment_fields() {
        let camera = Uuid::new_v4();
        let msg = Envelope::new(ServerMessage::Start {
            intent_id: Uuid::new_v4(),
            command_id: Uuid::new_v4(),
            camera_id: Some(camera),
            generation: Some(3),
            source_url: Some("rtsp://cams/entrance".into()),
            parameters: HashMap::new(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["generation"], 3);
        assert_eq!(json["camera_id"], serde_json::json!(camera));
    }
}
