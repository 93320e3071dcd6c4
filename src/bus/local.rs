use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use super::{BroadcastBus, BusError, Subscription};
use crate::models::SyncEvent;

/// In-process bus: one broadcast channel per user with live subscribers.
pub struct LocalBus {
    /// Key: user_id
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<SyncEvent>>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of users with an open channel.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Drops channels whose subscribers have all gone away.
    pub async fn prune(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }

    pub(crate) async fn publish_shared(&self, event: Arc<SyncEvent>) {
        let user_id = event.user_id.clone();
        let delivered = {
            let channels = self.channels.read().await;
            match channels.get(&user_id) {
                Some(sender) => sender.send(event).is_ok(),
                // Nobody on this instance follows the user.
                None => return,
            }
        };

        if !delivered {
            let mut channels = self.channels.write().await;
            if channels
                .get(&user_id)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                channels.remove(&user_id);
            }
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl BroadcastBus for LocalBus {
    async fn publish(&self, event: &SyncEvent) -> Result<(), BusError> {
        self.publish_shared(Arc::new(event.clone())).await;
        Ok(())
    }

    async fn subscribe(&self, user_id: &str) -> Subscription {
        let mut channels = self.channels.write().await;

        let receiver = match channels.get(user_id) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                channels.insert(user_id.to_string(), sender);
                receiver
            }
        };
        Subscription::new(receiver)
    }
}
