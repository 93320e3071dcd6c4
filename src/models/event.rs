use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::{EntityType, Operation};

/// One immutable entry of a user's sync log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: i64,
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub originating_device_id: String,
    pub server_timestamp: DateTime<Utc>,
    pub client_timestamp: Option<DateTime<Utc>>,
}

/// A change that has not been assigned an event id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub originating_device_id: String,
    pub client_timestamp: Option<DateTime<Utc>>,
    /// Cursor the client had applied when it produced the change.
    pub base_cursor: i64,
}

impl NewEvent {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload,
            originating_device_id: device_id.into(),
            client_timestamp: None,
            base_cursor: 0,
        }
    }

    pub fn with_base_cursor(mut self, base_cursor: i64) -> Self {
        self.base_cursor = base_cursor;
        self
    }

    pub fn with_client_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.client_timestamp = Some(ts);
        self
    }

    /// Materializes the event once the store has assigned its id and time.
    pub fn into_event(self, event_id: i64, server_timestamp: DateTime<Utc>) -> SyncEvent {
        SyncEvent {
            event_id,
            user_id: self.user_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            operation: self.operation,
            payload: self.payload,
            originating_device_id: self.originating_device_id,
            server_timestamp,
            client_timestamp: self.client_timestamp,
        }
    }
}

/// Last applied state of one entity, as seen by the conflict resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityHead {
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub last_event_id: i64,
    pub last_operation: Operation,
    pub last_device_id: String,
    pub last_server_timestamp: DateTime<Utc>,
    pub snapshot: Option<Value>,
    pub deleted: bool,
}
