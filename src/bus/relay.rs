use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{BroadcastBus, BusError, LocalBus, Subscription};
use crate::db::DeltaStore;
use crate::error::StoreError;
use crate::models::SyncEvent;

/// Events fetched per relay poll.
const RELAY_BATCH: i64 = 500;

/// Bus for instances sharing one database.
///
/// Local publishes go straight to the in-process [`LocalBus`]. A background
/// task follows the global storage sequence of `sync_events` and republishes
/// events accepted by other instances, so every instance sees every event at
/// least once.
pub struct RelayBus {
    local: Arc<LocalBus>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RelayBus {
    /// Starts relaying events appended after this call.
    pub async fn start(
        store: DeltaStore,
        capacity: usize,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let local = Arc::new(LocalBus::new(capacity));
        let start_seq = store.latest_seq().await?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        tracing::info!(
            instance_id = %store.instance_id(),
            start_seq,
            "starting event relay"
        );

        let task = tokio::spawn(relay_loop(
            store,
            local.clone(),
            start_seq,
            poll_interval,
            shutdown_rx,
        ));

        Ok(Self {
            local,
            shutdown,
            task: Some(task),
        })
    }

    /// Stops the relay task and waits for it to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn local(&self) -> &Arc<LocalBus> {
        &self.local
    }
}

impl Drop for RelayBus {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl BroadcastBus for RelayBus {
    async fn publish(&self, event: &SyncEvent) -> Result<(), BusError> {
        self.local.publish(event).await
    }

    async fn subscribe(&self, user_id: &str) -> Subscription {
        self.local.subscribe(user_id).await
    }
}

async fn relay_loop(
    store: DeltaStore,
    local: Arc<LocalBus>,
    mut last_seq: i64,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        // Drain everything available before sleeping again.
        loop {
            let batch = match store.events_after_seq(last_seq, RELAY_BATCH).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(last_seq, "relay poll failed: {}", e);
                    break;
                }
            };
            let full = batch.len() as i64 == RELAY_BATCH;

            for relayed in batch {
                last_seq = relayed.seq;
                if relayed.instance_id != store.instance_id() {
                    tracing::trace!(
                        user_id = %relayed.event.user_id,
                        event_id = relayed.event.event_id,
                        from = %relayed.instance_id,
                        "relaying event"
                    );
                    local.publish_shared(Arc::new(relayed.event)).await;
                }
            }

            if !full {
                break;
            }
        }
    }

    tracing::debug!(last_seq, "event relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusRecv;
    use crate::db::test_pool;
    use crate::models::{EntityType, NewEvent, Operation};
    use serde_json::json;

    fn draft(device: &str, id: &str) -> NewEvent {
        NewEvent::new("alice", device, EntityType::Bookmark, id, Operation::Create, json!({}))
    }

    async fn next(sub: &mut Subscription) -> BusRecv {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("relay delivered nothing")
    }

    #[tokio::test]
    async fn test_events_from_other_instance_are_relayed() {
        let (pool, _temp) = test_pool().await;
        let store_a = DeltaStore::new(pool.clone(), "node-a", 100);
        let store_b = DeltaStore::new(pool, "node-b", 100);

        let bus_b = RelayBus::start(store_b.clone(), 16, Duration::from_millis(10))
            .await
            .unwrap();
        let mut sub = bus_b.subscribe("alice").await;

        // Accepted on node-a; node-b only learns about it through the relay.
        let event = store_a.append(draft("laptop", "1")).await.unwrap();

        match next(&mut sub).await {
            BusRecv::Event(e) => assert_eq!(e.event_id, event.event_id),
            other => panic!("unexpected {:?}", other),
        }
        bus_b.stop().await;
    }

    #[tokio::test]
    async fn test_own_events_are_not_relayed_twice() {
        let (pool, _temp) = test_pool().await;
        let store_a = DeltaStore::new(pool.clone(), "node-a", 100);
        let store_b = DeltaStore::new(pool, "node-b", 100);

        let bus_b = RelayBus::start(store_b.clone(), 16, Duration::from_millis(10))
            .await
            .unwrap();
        let mut sub = bus_b.subscribe("alice").await;

        let own = store_b.append(draft("phone", "1")).await.unwrap();
        bus_b.publish(&own).await.unwrap();
        let foreign = store_a.append(draft("laptop", "2")).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            if let BusRecv::Event(e) = next(&mut sub).await {
                seen.push(e.event_id);
            }
        }
        assert_eq!(seen, vec![own.event_id, foreign.event_id]);

        // Nothing else arrives: node-b's own append was skipped by the relay.
        let extra = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(extra.is_err());
        bus_b.stop().await;
    }
}
