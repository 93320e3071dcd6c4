use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use super::{format_ts, parse_ts};
use crate::error::StoreError;
use crate::models::{Device, DeviceIdentity};

/// Default time a connection marker stays valid without a heartbeat.
pub const DEFAULT_DEVICE_LEASE_SECS: i64 = 90;

/// Known devices per user, their cursors and connection state.
///
/// A device is connected while some instance holds its marker and keeps
/// renewing the lease. Markers whose lease lapsed (the holding instance
/// crashed) count as disconnected.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    pool: SqlitePool,
    lease: Duration,
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    user_id: String,
    device_id: String,
    first_seen_at: String,
    last_seen_at: String,
    last_cursor: i64,
    connected_instance: Option<String>,
    connected_heartbeat_at: Option<String>,
    inactive: bool,
}

impl TryFrom<DeviceRow> for Device {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(Device {
            user_id: row.user_id,
            device_id: row.device_id,
            first_seen_at: parse_ts(&row.first_seen_at)?,
            last_seen_at: parse_ts(&row.last_seen_at)?,
            last_cursor: row.last_cursor,
            connected_instance: row.connected_instance,
            connected_heartbeat_at: row
                .connected_heartbeat_at
                .as_deref()
                .map(parse_ts)
                .transpose()?,
            inactive: row.inactive,
        })
    }
}

impl DeviceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            lease: Duration::seconds(DEFAULT_DEVICE_LEASE_SECS),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Heartbeats older than this no longer hold a connection.
    pub fn lease_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.lease
    }

    /// Registers the device (first sight) and marks it connected on `instance_id`.
    pub async fn connect(
        &self,
        identity: &DeviceIdentity,
        instance_id: &str,
    ) -> Result<Device, StoreError> {
        let now = format_ts(&Utc::now());
        let row: DeviceRow = sqlx::query_as(
            r#"
            INSERT INTO devices
                (user_id, device_id, first_seen_at, last_seen_at, connected_instance, connected_heartbeat_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, device_id) DO UPDATE SET
                last_seen_at = excluded.last_seen_at,
                connected_instance = excluded.connected_instance,
                connected_heartbeat_at = excluded.connected_heartbeat_at,
                inactive = 0
            RETURNING *
            "#,
        )
        .bind(&identity.user_id)
        .bind(&identity.device_id)
        .bind(&now)
        .bind(&now)
        .bind(instance_id)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    /// Marks the device disconnected, unless a newer session on another
    /// instance has taken it over since.
    pub async fn disconnect(
        &self,
        identity: &DeviceIdentity,
        instance_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE devices SET
                last_seen_at = ?,
                connected_heartbeat_at = CASE WHEN connected_instance = ? THEN NULL ELSE connected_heartbeat_at END,
                connected_instance = CASE WHEN connected_instance = ? THEN NULL ELSE connected_instance END
            WHERE user_id = ? AND device_id = ?
            "#,
        )
        .bind(format_ts(&Utc::now()))
        .bind(instance_id)
        .bind(instance_id)
        .bind(&identity.user_id)
        .bind(&identity.device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Renews the lease of a session on `instance_id`.
    ///
    /// Returns false when the marker now belongs to another instance.
    pub async fn heartbeat(
        &self,
        identity: &DeviceIdentity,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        let now = format_ts(&Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE devices SET connected_heartbeat_at = ?, last_seen_at = ?
            WHERE user_id = ? AND device_id = ? AND connected_instance = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(&identity.user_id)
        .bind(&identity.device_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, identity: &DeviceIdentity) -> Result<Option<Device>, StoreError> {
        let row: Option<DeviceRow> =
            sqlx::query_as("SELECT * FROM devices WHERE user_id = ? AND device_id = ?")
                .bind(&identity.user_id)
                .bind(&identity.device_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Device::try_from).transpose()
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        let rows: Vec<DeviceRow> =
            sqlx::query_as("SELECT * FROM devices WHERE user_id = ? ORDER BY device_id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Device::try_from).collect()
    }

    /// Moves the device cursor forward to `event_id`; never backwards.
    pub async fn advance_cursor(
        &self,
        identity: &DeviceIdentity,
        event_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE devices SET last_cursor = MAX(last_cursor, ?), last_seen_at = ?
            WHERE user_id = ? AND device_id = ?
            "#,
        )
        .bind(event_id)
        .bind(format_ts(&Utc::now()))
        .bind(&identity.user_id)
        .bind(&identity.device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advances the originating device past its own accepted change.
    ///
    /// Only applies when the device had already confirmed everything before
    /// it; otherwise the cursor waits for the device's ACK so that no
    /// unseen event is skipped.
    pub async fn record_accepted_change(
        &self,
        identity: &DeviceIdentity,
        event_id: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET last_cursor = ?, last_seen_at = ?
            WHERE user_id = ? AND device_id = ? AND last_cursor = ?
            "#,
        )
        .bind(event_id)
        .bind(format_ts(&Utc::now()))
        .bind(&identity.user_id)
        .bind(&identity.device_id)
        .bind(event_id - 1)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Active devices of the user with no live session, except `exclude`.
    pub async fn offline_devices(
        &self,
        user_id: &str,
        exclude_device: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT device_id FROM devices
            WHERE user_id = ? AND device_id != ? AND inactive = 0
              AND (connected_instance IS NULL
                   OR connected_heartbeat_at IS NULL
                   OR connected_heartbeat_at < ?)
            ORDER BY device_id
            "#,
        )
        .bind(user_id)
        .bind(exclude_device)
        .bind(format_ts(&self.lease_cutoff()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Flags disconnected devices unseen since `cutoff` as inactive.
    ///
    /// Inactive devices stop receiving offline queue entries; they catch up
    /// from the log on their next connection.
    pub async fn mark_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET inactive = 1, connected_instance = NULL, connected_heartbeat_at = NULL
            WHERE inactive = 0 AND last_seen_at < ?
              AND (connected_instance IS NULL
                   OR connected_heartbeat_at IS NULL
                   OR connected_heartbeat_at < ?)
            "#,
        )
        .bind(format_ts(&cutoff))
        .bind(format_ts(&self.lease_cutoff()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Clears connection flags left behind by a previous run of `instance_id`.
    pub async fn release_instance(&self, instance_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE devices SET connected_instance = NULL, connected_heartbeat_at = NULL WHERE connected_instance = ?",
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Clears connection markers whose lease lapsed.
    pub async fn release_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET connected_instance = NULL, connected_heartbeat_at = NULL
            WHERE connected_instance IS NOT NULL
              AND (connected_heartbeat_at IS NULL OR connected_heartbeat_at < ?)
            "#,
        )
        .bind(format_ts(&self.lease_cutoff()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration;

    fn device(user: &str, device: &str) -> DeviceIdentity {
        DeviceIdentity {
            user_id: user.to_string(),
            device_id: device.to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_registers_and_reconnect_keeps_cursor() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool);
        let laptop = device("alice", "laptop");

        let first = registry.connect(&laptop, "node-a").await.unwrap();
        assert_eq!(first.last_cursor, 0);
        assert_eq!(first.connected_instance.as_deref(), Some("node-a"));

        registry.advance_cursor(&laptop, 12).await.unwrap();
        registry.disconnect(&laptop, "node-a").await.unwrap();
        let stored = registry.get(&laptop).await.unwrap().unwrap();
        assert!(!stored.is_connected());
        assert_eq!(stored.last_cursor, 12);

        let again = registry.connect(&laptop, "node-b").await.unwrap();
        assert_eq!(again.last_cursor, 12);
        assert_eq!(again.first_seen_at, first.first_seen_at);
        assert_eq!(again.connected_instance.as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_newer_session() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool);
        let phone = device("alice", "phone");

        registry.connect(&phone, "node-a").await.unwrap();
        registry.connect(&phone, "node-b").await.unwrap();
        // The old session on node-a ends after node-b took over.
        registry.disconnect(&phone, "node-a").await.unwrap();

        let stored = registry.get(&phone).await.unwrap().unwrap();
        assert_eq!(stored.connected_instance.as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool);
        let laptop = device("alice", "laptop");
        registry.connect(&laptop, "node-a").await.unwrap();

        registry.advance_cursor(&laptop, 10).await.unwrap();
        registry.advance_cursor(&laptop, 4).await.unwrap();
        assert_eq!(registry.get(&laptop).await.unwrap().unwrap().last_cursor, 10);
    }

    #[tokio::test]
    async fn test_accepted_change_only_advances_contiguous_cursor() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool);
        let laptop = device("alice", "laptop");
        registry.connect(&laptop, "node-a").await.unwrap();

        assert!(registry.record_accepted_change(&laptop, 1).await.unwrap());
        // Event 2 came from someone else and is not acknowledged yet.
        assert!(!registry.record_accepted_change(&laptop, 3).await.unwrap());
        assert_eq!(registry.get(&laptop).await.unwrap().unwrap().last_cursor, 1);
    }

    #[tokio::test]
    async fn test_offline_devices_and_inactivity() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool);
        let laptop = device("alice", "laptop");
        let phone = device("alice", "phone");
        let tablet = device("alice", "tablet");

        for d in [&laptop, &phone, &tablet] {
            registry.connect(d, "node-a").await.unwrap();
        }
        registry.disconnect(&phone, "node-a").await.unwrap();
        registry.disconnect(&tablet, "node-a").await.unwrap();

        let offline = registry.offline_devices("alice", "laptop").await.unwrap();
        assert_eq!(offline, vec!["phone".to_string(), "tablet".to_string()]);

        let marked = registry
            .mark_inactive(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        // The connected laptop is never marked inactive.
        assert_eq!(marked, 2);
        assert!(registry
            .offline_devices("alice", "laptop")
            .await
            .unwrap()
            .is_empty());

        let revived = registry.connect(&phone, "node-a").await.unwrap();
        assert!(!revived.inactive);
    }

    #[tokio::test]
    async fn test_release_instance() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool);
        registry.connect(&device("alice", "a"), "crashed").await.unwrap();
        registry.connect(&device("bob", "b"), "crashed").await.unwrap();
        registry.connect(&device("bob", "c"), "alive").await.unwrap();

        assert_eq!(registry.release_instance("crashed").await.unwrap(), 2);
        let bob = registry.list("bob").await.unwrap();
        assert!(!bob[0].is_connected());
        assert!(bob[1].is_connected());
    }

    #[tokio::test]
    async fn test_lapsed_lease_counts_as_offline() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool).with_lease(Duration::milliseconds(50));
        let laptop = device("alice", "laptop");
        let phone = device("alice", "phone");

        registry.connect(&laptop, "node-a").await.unwrap();
        // node-b goes away without disconnecting the phone.
        registry.connect(&phone, "node-b").await.unwrap();
        assert!(registry
            .offline_devices("alice", "laptop")
            .await
            .unwrap()
            .is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(registry.heartbeat(&laptop, "node-a").await.unwrap());

        let offline = registry.offline_devices("alice", "tablet").await.unwrap();
        assert_eq!(offline, vec!["phone".to_string()]);

        let stored = registry.get(&phone).await.unwrap().unwrap();
        assert!(stored.is_connected());
        assert!(!stored.holds_lease(registry.lease_cutoff()));
    }

    #[tokio::test]
    async fn test_lapsed_lease_can_go_inactive_and_be_released() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool).with_lease(Duration::milliseconds(50));
        let laptop = device("alice", "laptop");
        let phone = device("alice", "phone");

        registry.connect(&laptop, "node-a").await.unwrap();
        registry.connect(&phone, "node-b").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        registry.heartbeat(&laptop, "node-a").await.unwrap();

        assert_eq!(registry.release_expired().await.unwrap(), 1);
        assert!(!registry.get(&phone).await.unwrap().unwrap().is_connected());

        registry.connect(&phone, "node-b").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        registry.heartbeat(&laptop, "node-a").await.unwrap();
        let marked = registry
            .mark_inactive(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(marked, 1);
        let phone_row = registry.get(&phone).await.unwrap().unwrap();
        assert!(phone_row.inactive);
        assert!(!phone_row.is_connected());
    }

    #[tokio::test]
    async fn test_heartbeat_only_renews_own_marker() {
        let (pool, _temp) = test_pool().await;
        let registry = DeviceRegistry::new(pool);
        let phone = device("alice", "phone");

        registry.connect(&phone, "node-a").await.unwrap();
        registry.connect(&phone, "node-b").await.unwrap();
        assert!(!registry.heartbeat(&phone, "node-a").await.unwrap());
        assert!(registry.heartbeat(&phone, "node-b").await.unwrap());
    }
}
