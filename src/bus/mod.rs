//! Per-user fan-out of accepted events to live sessions.
//!
//! Delivery is at-least-once: subscribers may see an event twice (for
//! example once locally and once through a relay) and must drop ids they
//! have already applied. A subscriber that falls behind the channel
//! capacity is told how many events it missed and backfills from the log.

mod local;
mod relay;

pub use local::LocalBus;
pub use relay::RelayBus;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::SyncEvent;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Pub/sub transport shared by every session of an instance.
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Delivers `event` to every subscriber of its user.
    async fn publish(&self, event: &SyncEvent) -> Result<(), BusError>;

    /// Opens a subscription to all events published for `user_id` from now on.
    async fn subscribe(&self, user_id: &str) -> Subscription;
}

/// Outcome of waiting on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum BusRecv {
    Event(Arc<SyncEvent>),
    /// The subscriber was too slow; this many events were dropped for it.
    Lagged(u64),
    Closed,
}

/// Receiving half of a user's channel.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<SyncEvent>>,
}

impl Subscription {
    pub(crate) fn new(receiver: broadcast::Receiver<Arc<SyncEvent>>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> BusRecv {
        match self.receiver.recv().await {
            Ok(event) => BusRecv::Event(event),
            Err(broadcast::error::RecvError::Lagged(n)) => BusRecv::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => BusRecv::Closed,
        }
    }
}
