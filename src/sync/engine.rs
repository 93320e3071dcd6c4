use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

use super::protocol::ChangeRequest;
use super::resolver::ConflictResolver;
use super::retry::RetryPolicy;
use crate::auth::{AuthService, Claims};
use crate::bus::{BroadcastBus, Subscription};
use crate::config::ServerConfig;
use crate::db::{AppendOutcome, DeltaStore, DeviceRegistry, OfflineQueue};
use crate::error::{StoreError, SyncError};
use crate::models::{Device, DeviceIdentity, SyncEvent};

/// Timeouts applied by sessions before they reach the streaming state.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub auth: Duration,
    pub handshake: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            auth: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
        }
    }
}

/// Initial batch for a (re)connecting device.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeBatch {
    /// The user's max cursor when the batch was assembled.
    pub max_cursor: i64,
    /// Every event after the device's cursor up to `max_cursor`, ascending.
    pub events: Vec<SyncEvent>,
}

/// Shared state behind every sync session of one instance.
pub struct SyncEngine {
    store: DeltaStore,
    registry: DeviceRegistry,
    queue: OfflineQueue,
    bus: Arc<dyn BroadcastBus>,
    auth: Arc<dyn AuthService>,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    timeouts: SessionTimeouts,
    locks: UserLocks,
}

impl SyncEngine {
    pub fn new(
        store: DeltaStore,
        registry: DeviceRegistry,
        queue: OfflineQueue,
        bus: Arc<dyn BroadcastBus>,
        auth: Arc<dyn AuthService>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            bus,
            auth,
            resolver: ConflictResolver::default(),
            retry: RetryPolicy::default(),
            timeouts: SessionTimeouts::default(),
            locks: UserLocks::default(),
        }
    }

    /// Builds an engine over `pool` with every setting taken from `config`.
    pub fn from_config(
        pool: SqlitePool,
        config: &ServerConfig,
        bus: Arc<dyn BroadcastBus>,
        auth: Arc<dyn AuthService>,
    ) -> Self {
        let store = DeltaStore::new(pool.clone(), config.instance_id.clone(), config.page_size);
        Self::new(
            store,
            DeviceRegistry::new(pool.clone()).with_lease(config.device_lease()),
            OfflineQueue::new(pool),
            bus,
            auth,
        )
        .with_resolver(ConflictResolver::new(config.max_cursor_lag))
        .with_retry(config.retry_policy())
        .with_timeouts(SessionTimeouts {
            auth: config.auth_timeout(),
            handshake: config.handshake_timeout(),
        })
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    pub fn store(&self) -> &DeltaStore {
        &self.store
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn instance_id(&self) -> &str {
        self.store.instance_id()
    }

    /// How often streaming sessions renew their device lease.
    pub fn heartbeat_interval(&self) -> Duration {
        let lease = self.registry.lease().to_std().unwrap_or(Duration::ZERO);
        (lease / 3).max(Duration::from_millis(10))
    }

    pub async fn authenticate(&self, token: &str) -> Result<Claims, SyncError> {
        Ok(self.auth.validate_token(token).await?)
    }

    /// Registers the device as connected on this instance.
    pub async fn open_device(&self, identity: &DeviceIdentity) -> Result<Device, SyncError> {
        let device = self
            .retry
            .run("register device", || {
                self.registry.connect(identity, self.instance_id())
            })
            .await?;
        tracing::info!(
            user_id = %identity.user_id,
            device_id = %identity.device_id,
            last_cursor = device.last_cursor,
            "device connected"
        );
        Ok(device)
    }

    /// Marks the device disconnected. Failures are logged, not returned:
    /// the session is already going away.
    pub async fn close_device(&self, identity: &DeviceIdentity) {
        let result = self
            .retry
            .run("unregister device", || {
                self.registry.disconnect(identity, self.instance_id())
            })
            .await;
        match result {
            Ok(()) => tracing::info!(
                user_id = %identity.user_id,
                device_id = %identity.device_id,
                "device disconnected"
            ),
            Err(e) => tracing::warn!(
                user_id = %identity.user_id,
                device_id = %identity.device_id,
                "failed to mark device disconnected: {}",
                e
            ),
        }
    }

    /// Renews the device's connection lease. Failures are logged, not returned.
    pub async fn refresh_device(&self, identity: &DeviceIdentity) {
        let result = self
            .retry
            .run("renew device lease", || {
                self.registry.heartbeat(identity, self.instance_id())
            })
            .await;
        match result {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                user_id = %identity.user_id,
                device_id = %identity.device_id,
                "device lease held by another instance"
            ),
            Err(e) => tracing::warn!(
                user_id = %identity.user_id,
                device_id = %identity.device_id,
                "failed to renew device lease: {}",
                e
            ),
        }
    }

    pub async fn subscribe(&self, user_id: &str) -> Subscription {
        self.bus.subscribe(user_id).await
    }

    /// Assembles the catch-up batch for a device that has applied
    /// everything up to `last_cursor`.
    ///
    /// Callers subscribe to the bus first; events appended after the max
    /// cursor read here then arrive live.
    pub async fn handshake(
        &self,
        identity: &DeviceIdentity,
        last_cursor: i64,
    ) -> Result<HandshakeBatch, SyncError> {
        let user_id = identity.user_id.as_str();
        let max_cursor = self
            .retry
            .run("read max cursor", || self.store.max_cursor(user_id))
            .await?;

        if last_cursor > max_cursor {
            return Err(SyncError::stale_cursor(format!(
                "cursor {} is ahead of the log (max {})",
                last_cursor, max_cursor
            )));
        }

        // The client vouches for everything up to its cursor.
        self.retry
            .run("advance cursor", || {
                self.registry.advance_cursor(identity, last_cursor)
            })
            .await?;
        self.retry
            .run("acknowledge queue", || {
                self.queue.acknowledge_through(identity, last_cursor)
            })
            .await?;

        let queued = self
            .retry
            .run("drain offline queue", || self.queue.drain(identity))
            .await?;
        let logged = self
            .retry
            .run("read log", || async {
                use futures::TryStreamExt;
                self.store
                    .since_until(user_id, last_cursor, max_cursor)
                    .into_stream()
                    .try_collect::<Vec<_>>()
                    .await
            })
            .await?;

        let queued_count = queued.len();
        let mut merged: BTreeMap<i64, SyncEvent> = BTreeMap::new();
        for event in queued.into_iter().chain(logged) {
            if event.event_id > last_cursor && event.event_id <= max_cursor {
                merged.entry(event.event_id).or_insert(event);
            }
        }

        tracing::debug!(
            user_id = %identity.user_id,
            device_id = %identity.device_id,
            last_cursor,
            max_cursor,
            queued = queued_count,
            batch = merged.len(),
            "handshake batch assembled"
        );

        Ok(HandshakeBatch {
            max_cursor,
            events: merged.into_values().collect(),
        })
    }

    /// Validates, adjudicates, appends and publishes one client change.
    pub async fn submit_change(
        &self,
        identity: &DeviceIdentity,
        change: ChangeRequest,
    ) -> Result<SyncEvent, SyncError> {
        change.validate()?;
        let draft = change.into_event(&identity.user_id, &identity.device_id);

        let event = {
            let _guard = self.locks.lock(&identity.user_id).await;

            let outcome = self
                .retry
                .run("append event", || {
                    self.store.append_checked(draft.clone(), &self.resolver)
                })
                .await?;

            let event = match outcome {
                AppendOutcome::Appended(event) => event,
                AppendOutcome::Rejected(rejection) => {
                    tracing::info!(
                        user_id = %identity.user_id,
                        device_id = %identity.device_id,
                        entity = %draft.entity_id,
                        code = %rejection.code,
                        "change rejected: {}",
                        rejection.reason
                    );
                    return Err(rejection.into());
                }
            };

            if let Err(e) = self
                .retry
                .run("record accepted change", || {
                    self.registry.record_accepted_change(identity, event.event_id)
                })
                .await
            {
                tracing::warn!(event_id = event.event_id, "failed to advance device cursor: {}", e);
            }

            // Published under the lock so local subscribers see ids in order.
            if let Err(e) = self.bus.publish(&event).await {
                tracing::warn!(event_id = event.event_id, "failed to publish event: {}", e);
            }
            event
        };

        tracing::info!(
            user_id = %event.user_id,
            device_id = %event.originating_device_id,
            event_id = event.event_id,
            entity_type = %event.entity_type,
            operation = %event.operation,
            "change accepted"
        );

        self.enqueue_for_offline_devices(identity, event.event_id).await;
        Ok(event)
    }

    async fn enqueue_for_offline_devices(&self, identity: &DeviceIdentity, event_id: i64) {
        let result = self
            .retry
            .run("enqueue for offline devices", || async {
                let offline = self
                    .registry
                    .offline_devices(&identity.user_id, &identity.device_id)
                    .await?;
                self.queue
                    .enqueue_many(&identity.user_id, &offline, event_id)
                    .await?;
                Ok::<_, StoreError>(offline.len())
            })
            .await;
        match result {
            Ok(0) => {}
            Ok(n) => tracing::debug!(event_id, devices = n, "queued for offline devices"),
            // Devices still recover the event from the log on reconnect.
            Err(e) => tracing::warn!(event_id, "failed to enqueue for offline devices: {}", e),
        }
    }

    /// Cumulative acknowledgment: the device has applied every event up to
    /// and including `event_id`.
    pub async fn acknowledge(&self, identity: &DeviceIdentity, event_id: i64) -> Result<(), SyncError> {
        self.retry
            .run("advance cursor", || self.registry.advance_cursor(identity, event_id))
            .await?;
        self.retry
            .run("acknowledge queue", || {
                self.queue.acknowledge_through(identity, event_id)
            })
            .await?;
        Ok(())
    }

    /// Every event after `cursor`, for sessions that fell behind the bus.
    pub async fn backfill(&self, user_id: &str, cursor: i64) -> Result<Vec<SyncEvent>, SyncError> {
        Ok(self
            .retry
            .run("backfill", || self.store.collect_since(user_id, cursor))
            .await?)
    }
}

/// Per-user async mutexes serializing the append path within one instance.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Idle entries are pruned once the map grows past this size.
const USER_LOCKS_PRUNE_AT: usize = 1024;

impl UserLocks {
    async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() >= USER_LOCKS_PRUNE_AT {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
