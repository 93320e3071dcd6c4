use chrono::{DateTime, Utc};

/// One pending (or delivered) event for a device that was offline when the
/// event was published.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineQueueEntry {
    pub user_id: String,
    pub device_id: String,
    pub event_id: i64,
    pub enqueued_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
}
