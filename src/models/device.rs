use chrono::{DateTime, Utc};
use serde::Serialize;

/// A client installation belonging to one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub user_id: String,
    pub device_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_cursor: i64,
    /// Instance currently holding a live session for this device.
    pub connected_instance: Option<String>,
    /// Last time the holding session renewed its lease.
    pub connected_heartbeat_at: Option<DateTime<Utc>>,
    pub inactive: bool,
}

impl Device {
    pub fn is_connected(&self) -> bool {
        self.connected_instance.is_some()
    }

    /// Whether the connection marker is still backed by a live session.
    pub fn holds_lease(&self, lease_cutoff: DateTime<Utc>) -> bool {
        self.is_connected()
            && self
                .connected_heartbeat_at
                .is_some_and(|beat| beat >= lease_cutoff)
    }
}

/// Authenticated principal of a sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_id: String,
}
