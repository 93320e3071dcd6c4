//! Wire protocol: JSON text frames tagged by `type`.
//!
//! ```json
//! {"type":"AUTH","token":"..."}
//! {"type":"HELLO","device_id":"laptop","last_cursor":41}
//! {"type":"CHANGE","entity_type":"bookmark","entity_id":"7","operation":"update",
//!  "payload":{"title":"New"},"client_timestamp":"2026-03-01T08:30:00Z","base_cursor":41}
//! {"type":"ACK","event_id":42}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, SyncError};
use crate::models::{EntityType, NewEvent, Operation, SyncEvent};

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Auth { token: String },
    Hello { device_id: String, last_cursor: i64 },
    Change(ChangeRequest),
    Ack { event_id: i64 },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "AUTH",
            ClientMessage::Hello { .. } => "HELLO",
            ClientMessage::Change(_) => "CHANGE",
            ClientMessage::Ack { .. } => "ACK",
        }
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(format!("malformed frame: {}", e)))
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

/// A client's proposed modification to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Opaque client correlation id, echoed in the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<DateTime<Utc>>,
    pub base_cursor: i64,
}

impl ChangeRequest {
    /// Rejects changes that can never be applied, independent of log state.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.entity_id.trim().is_empty() {
            return Err(SyncError::Validation("entity_id must not be empty".into()));
        }
        if self.base_cursor < 0 {
            return Err(SyncError::Validation("base_cursor must not be negative".into()));
        }
        match self.operation {
            Operation::Create if !self.payload.is_object() => Err(SyncError::Validation(
                "create payload must be a JSON object".into(),
            )),
            Operation::Update if !self.payload.is_object() => Err(SyncError::Validation(
                "update payload must be a JSON object".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn into_event(self, user_id: &str, device_id: &str) -> NewEvent {
        let mut draft = NewEvent::new(
            user_id,
            device_id,
            self.entity_type,
            self.entity_id,
            self.operation,
            self.payload,
        )
        .with_base_cursor(self.base_cursor);
        draft.client_timestamp = self.client_timestamp;
        draft
    }
}

/// Remediation suggested alongside a rejected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestedAction {
    Resync,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Welcome {
        max_cursor: i64,
    },
    Delta {
        event_id: i64,
        entity_type: EntityType,
        entity_id: String,
        operation: Operation,
        payload: Value,
        server_timestamp: DateTime<Utc>,
        originating_device_id: String,
    },
    ChangeAccepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        change_id: Option<String>,
        event_id: i64,
    },
    ChangeRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        change_id: Option<String>,
        code: ErrorCode,
        reason: String,
        suggested_action: SuggestedAction,
    },
    Error {
        code: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    pub fn delta(event: &SyncEvent) -> Self {
        ServerMessage::Delta {
            event_id: event.event_id,
            entity_type: event.entity_type,
            entity_id: event.entity_id.clone(),
            operation: event.operation,
            payload: event.payload.clone(),
            server_timestamp: event.server_timestamp,
            originating_device_id: event.originating_device_id.clone(),
        }
    }

    pub fn rejected(change_id: Option<String>, error: &SyncError) -> Self {
        ServerMessage::ChangeRejected {
            change_id,
            code: error.code(),
            reason: error.to_string(),
            suggested_action: SuggestedAction::Resync,
        }
    }

    pub fn error(error: &SyncError) -> Self {
        ServerMessage::Error {
            code: error.code(),
            message: Some(error.to_string()),
        }
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(format!("malformed frame: {}", e)))
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}
