use chrono::{SubsecRound, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{format_ts, parse_ts};
use crate::error::StoreError;
use crate::models::{apply_operation, EntityHead, EntityType, NewEvent, SyncEvent};
use crate::sync::resolver::{Candidate, ConflictResolver, Rejection, Resolution, Version};

/// Append-only, per-user ordered event log.
///
/// Event ids come from the `user_cursors` row, incremented as the first
/// statement of the append transaction. The write lock taken by that
/// statement serializes appends for the whole database, so ids for one user
/// are contiguous and become visible in order.
#[derive(Debug, Clone)]
pub struct DeltaStore {
    pool: SqlitePool,
    instance_id: String,
    page_size: i64,
}

/// Result of an adjudicated append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(SyncEvent),
    Rejected(Rejection),
}

/// An event read by global storage order, for cross-instance relaying.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedEvent {
    pub seq: i64,
    pub instance_id: String,
    pub event: SyncEvent,
}

#[derive(sqlx::FromRow)]
pub(super) struct EventRow {
    seq: i64,
    user_id: String,
    event_id: i64,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    device_id: String,
    instance_id: String,
    server_timestamp: String,
    client_timestamp: Option<String>,
}

impl EventRow {
    pub(super) fn into_event(self) -> Result<SyncEvent, StoreError> {
        Ok(SyncEvent {
            event_id: self.event_id,
            user_id: self.user_id,
            entity_type: self.entity_type.parse().map_err(StoreError::Corrupt)?,
            entity_id: self.entity_id,
            operation: self.operation.parse().map_err(StoreError::Corrupt)?,
            payload: serde_json::from_str(&self.payload)?,
            originating_device_id: self.device_id,
            server_timestamp: parse_ts(&self.server_timestamp)?,
            client_timestamp: self.client_timestamp.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HeadRow {
    user_id: String,
    entity_type: String,
    entity_id: String,
    last_event_id: i64,
    last_operation: String,
    last_device_id: String,
    last_server_timestamp: String,
    snapshot: Option<String>,
    deleted: bool,
}

impl HeadRow {
    fn into_head(self) -> Result<EntityHead, StoreError> {
        Ok(EntityHead {
            user_id: self.user_id,
            entity_type: self.entity_type.parse().map_err(StoreError::Corrupt)?,
            entity_id: self.entity_id,
            last_event_id: self.last_event_id,
            last_operation: self.last_operation.parse().map_err(StoreError::Corrupt)?,
            last_device_id: self.last_device_id,
            last_server_timestamp: parse_ts(&self.last_server_timestamp)?,
            snapshot: self.snapshot.as_deref().map(serde_json::from_str).transpose()?,
            deleted: self.deleted,
        })
    }
}

const EVENT_COLUMNS: &str = "seq, user_id, event_id, entity_type, entity_id, operation, payload, \
     device_id, instance_id, server_timestamp, client_timestamp";

impl DeltaStore {
    pub fn new(pool: SqlitePool, instance_id: impl Into<String>, page_size: i64) -> Self {
        Self {
            pool,
            instance_id: instance_id.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Appends an event unconditionally and returns it with its new id.
    pub async fn append(&self, draft: NewEvent) -> Result<SyncEvent, StoreError> {
        match self.append_inner(draft, None).await? {
            AppendOutcome::Appended(event) => Ok(event),
            AppendOutcome::Rejected(r) => Err(StoreError::Corrupt(format!(
                "unadjudicated append rejected: {}",
                r.reason
            ))),
        }
    }

    /// Appends an event after the resolver accepted it against the entity's
    /// current head. Adjudication and the write share one transaction, so a
    /// rejection consumes no event id.
    pub async fn append_checked(
        &self,
        draft: NewEvent,
        resolver: &ConflictResolver,
    ) -> Result<AppendOutcome, StoreError> {
        self.append_inner(draft, Some(resolver)).await
    }

    async fn append_inner(
        &self,
        draft: NewEvent,
        resolver: Option<&ConflictResolver>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let (event_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO user_cursors (user_id, last_event_id) VALUES (?, 1)
            ON CONFLICT(user_id) DO UPDATE SET last_event_id = user_cursors.last_event_id + 1
            RETURNING last_event_id
            "#,
        )
        .bind(&draft.user_id)
        .fetch_one(&mut *tx)
        .await?;

        let head = Self::load_head(&mut tx, &draft.user_id, draft.entity_type, &draft.entity_id)
            .await?;
        let server_timestamp = Utc::now().trunc_subsecs(6);

        if let Some(resolver) = resolver {
            let candidate = Candidate {
                version: Version {
                    operation: draft.operation,
                    server_timestamp,
                    device_id: &draft.originating_device_id,
                    event_id,
                },
                base_cursor: draft.base_cursor,
                max_cursor: event_id - 1,
            };
            if let Resolution::Reject(rejection) = resolver.resolve(&candidate, head.as_ref()) {
                tx.rollback().await?;
                return Ok(AppendOutcome::Rejected(rejection));
            }
        }

        let event = draft.into_event(event_id, server_timestamp);
        let payload = serde_json::to_string(&event.payload)?;

        sqlx::query(
            r#"
            INSERT INTO sync_events (user_id, event_id, entity_type, entity_id, operation, payload, device_id, instance_id, server_timestamp, client_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.user_id)
        .bind(event.event_id)
        .bind(event.entity_type.as_str())
        .bind(&event.entity_id)
        .bind(event.operation.as_str())
        .bind(&payload)
        .bind(&event.originating_device_id)
        .bind(&self.instance_id)
        .bind(format_ts(&event.server_timestamp))
        .bind(event.client_timestamp.as_ref().map(format_ts))
        .execute(&mut *tx)
        .await?;

        let snapshot = apply_operation(
            head.and_then(|h| h.snapshot),
            event.operation,
            &event.payload,
        );
        let snapshot = snapshot.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO entity_heads (user_id, entity_type, entity_id, last_event_id, last_operation, last_device_id, last_server_timestamp, snapshot, deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, entity_type, entity_id) DO UPDATE SET
                last_event_id = excluded.last_event_id,
                last_operation = excluded.last_operation,
                last_device_id = excluded.last_device_id,
                last_server_timestamp = excluded.last_server_timestamp,
                snapshot = excluded.snapshot,
                deleted = excluded.deleted
            "#,
        )
        .bind(&event.user_id)
        .bind(event.entity_type.as_str())
        .bind(&event.entity_id)
        .bind(event.event_id)
        .bind(event.operation.as_str())
        .bind(&event.originating_device_id)
        .bind(format_ts(&event.server_timestamp))
        .bind(&snapshot)
        .bind(snapshot.is_none())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            user_id = %event.user_id,
            event_id = event.event_id,
            entity = %event.entity_id,
            operation = %event.operation,
            "appended sync event"
        );

        Ok(AppendOutcome::Appended(event))
    }

    async fn load_head(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntityHead>, StoreError> {
        let row: Option<HeadRow> = sqlx::query_as(
            "SELECT * FROM entity_heads WHERE user_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(user_id)
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(HeadRow::into_head).transpose()
    }

    /// Highest event id assigned for the user, 0 if the log is empty.
    pub async fn max_cursor(&self, user_id: &str) -> Result<i64, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_event_id FROM user_cursors WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0).unwrap_or(0))
    }

    /// Reads up to `limit` events with `cursor < event_id <= upper`.
    pub async fn page(
        &self,
        user_id: &str,
        cursor: i64,
        upper: i64,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM sync_events \
             WHERE user_id = ? AND event_id > ? AND event_id <= ? \
             ORDER BY event_id LIMIT ?"
        ))
        .bind(user_id)
        .bind(cursor)
        .bind(upper)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Every event after `cursor` up to the max cursor at call time.
    pub async fn since(&self, user_id: &str, cursor: i64) -> Result<EventPages, StoreError> {
        let upper = self.max_cursor(user_id).await?;
        Ok(self.since_until(user_id, cursor, upper))
    }

    /// Events in `(cursor, upper]`, fetched lazily page by page.
    pub fn since_until(&self, user_id: &str, cursor: i64, upper: i64) -> EventPages {
        EventPages {
            store: self.clone(),
            user_id: user_id.to_string(),
            position: cursor,
            upper,
        }
    }

    /// Convenience for callers that need the whole range in memory.
    pub async fn collect_since(&self, user_id: &str, cursor: i64) -> Result<Vec<SyncEvent>, StoreError> {
        self.since(user_id, cursor).await?.into_stream().try_collect().await
    }

    /// LoadEntity: the persisted state of one entity.
    pub async fn entity_head(
        &self,
        user_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntityHead>, StoreError> {
        let row: Option<HeadRow> = sqlx::query_as(
            "SELECT * FROM entity_heads WHERE user_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(user_id)
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(HeadRow::into_head).transpose()
    }

    /// All entity heads of a user, ordered by type and id.
    pub async fn entity_heads(&self, user_id: &str) -> Result<Vec<EntityHead>, StoreError> {
        let rows: Vec<HeadRow> = sqlx::query_as(
            "SELECT * FROM entity_heads WHERE user_id = ? ORDER BY entity_type, entity_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(HeadRow::into_head).collect()
    }

    /// Highest global storage sequence, the relay's starting point.
    pub async fn latest_seq(&self) -> Result<i64, StoreError> {
        let (seq,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM sync_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    /// Events of every user after `after_seq`, in storage order.
    pub async fn events_after_seq(
        &self,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<RelayedEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM sync_events WHERE seq > ? ORDER BY seq LIMIT ?"
        ))
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let seq = row.seq;
                let instance_id = row.instance_id.clone();
                Ok(RelayedEvent {
                    seq,
                    instance_id,
                    event: row.into_event()?,
                })
            })
            .collect()
    }
}

/// Lazy, finite, restartable view over a user's log.
///
/// Bounded above by the max cursor observed when it was created; events
/// appended later are delivered through the bus instead.
#[derive(Debug, Clone)]
pub struct EventPages {
    store: DeltaStore,
    user_id: String,
    position: i64,
    upper: i64,
}

impl EventPages {
    /// Id of the last event handed out (or the starting cursor).
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn upper(&self) -> i64 {
        self.upper
    }

    /// Rewinds (or fast-forwards) to `cursor`, keeping the upper bound.
    pub fn restart_from(&mut self, cursor: i64) {
        self.position = cursor;
    }

    /// Fetches the next page, `None` once the range is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<SyncEvent>>, StoreError> {
        if self.position >= self.upper {
            return Ok(None);
        }
        let page = self
            .store
            .page(&self.user_id, self.position, self.upper, self.store.page_size)
            .await?;
        match page.last() {
            Some(last) => {
                self.position = last.event_id;
                Ok(Some(page))
            }
            None => {
                self.position = self.upper;
                Ok(None)
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<SyncEvent, StoreError>> {
        stream::try_unfold(self, |mut pages| async move {
            let next = pages.next_page().await?;
            Ok::<_, StoreError>(next.map(|page| (page, pages)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, StoreError>)))
        .try_flatten()
    }
}
