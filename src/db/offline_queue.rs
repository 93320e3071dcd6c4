use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::delta_store::EventRow;
use super::{format_ts, parse_ts};
use crate::error::StoreError;
use crate::models::{DeviceIdentity, OfflineQueueEntry, SyncEvent};

/// Durable per-device backlog of events published while the device was away.
///
/// Entries are only marked delivered, never removed by a drain, so a
/// session that fails half way through redelivers everything on the next
/// connection.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    user_id: String,
    device_id: String,
    event_id: i64,
    enqueued_at: String,
    delivered: bool,
    delivered_at: Option<String>,
}

impl TryFrom<EntryRow> for OfflineQueueEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(OfflineQueueEntry {
            user_id: row.user_id,
            device_id: row.device_id,
            event_id: row.event_id,
            enqueued_at: parse_ts(&row.enqueued_at)?,
            delivered: row.delivered,
            delivered_at: row.delivered_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

impl OfflineQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Queues `event_id` for the device. Enqueuing twice is a no-op.
    pub async fn enqueue(&self, device: &DeviceIdentity, event_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO offline_queue (user_id, device_id, event_id, enqueued_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&device.user_id)
        .bind(&device.device_id)
        .bind(event_id)
        .bind(format_ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Queues one event for several devices of the same user atomically.
    pub async fn enqueue_many(
        &self,
        user_id: &str,
        device_ids: &[String],
        event_id: i64,
    ) -> Result<(), StoreError> {
        if device_ids.is_empty() {
            return Ok(());
        }

        let now = format_ts(&Utc::now());
        let mut tx = self.pool.begin().await?;
        for device_id in device_ids {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO offline_queue (user_id, device_id, event_id, enqueued_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(user_id)
            .bind(device_id)
            .bind(event_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Undelivered events for the device, in event id order.
    pub async fn drain(&self, device: &DeviceIdentity) -> Result<Vec<SyncEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT e.* FROM offline_queue q
            JOIN sync_events e ON e.user_id = q.user_id AND e.event_id = q.event_id
            WHERE q.user_id = ? AND q.device_id = ? AND q.delivered = 0
            ORDER BY q.event_id
            "#,
        )
        .bind(&device.user_id)
        .bind(&device.device_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Marks a single entry delivered.
    pub async fn acknowledge(&self, device: &DeviceIdentity, event_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE offline_queue SET delivered = 1, delivered_at = ?
            WHERE user_id = ? AND device_id = ? AND event_id = ? AND delivered = 0
            "#,
        )
        .bind(format_ts(&Utc::now()))
        .bind(&device.user_id)
        .bind(&device.device_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks every entry up to and including `event_id` delivered.
    pub async fn acknowledge_through(
        &self,
        device: &DeviceIdentity,
        event_id: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE offline_queue SET delivered = 1, delivered_at = ?
            WHERE user_id = ? AND device_id = ? AND event_id <= ? AND delivered = 0
            "#,
        )
        .bind(format_ts(&Utc::now()))
        .bind(&device.user_id)
        .bind(&device.device_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn pending_count(&self, device: &DeviceIdentity) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM offline_queue WHERE user_id = ? AND device_id = ? AND delivered = 0",
        )
        .bind(&device.user_id)
        .bind(&device.device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// All entries for the device, delivered or not.
    pub async fn entries(&self, device: &DeviceIdentity) -> Result<Vec<OfflineQueueEntry>, StoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT * FROM offline_queue WHERE user_id = ? AND device_id = ? ORDER BY event_id",
        )
        .bind(&device.user_id)
        .bind(&device.device_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OfflineQueueEntry::try_from).collect()
    }

    /// Deletes delivered entries older than `cutoff`.
    pub async fn purge_delivered(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM offline_queue WHERE delivered = 1 AND delivered_at < ?")
                .bind(format_ts(&cutoff))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
