use async_trait::async_trait;
use tokio::sync::mpsc;

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::SyncError;

/// Bidirectional frame channel a session runs over.
#[async_trait]
pub trait Transport: Send {
    /// Next client frame; `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<ClientMessage, SyncError>>;

    /// Writes one frame. Fails with [`SyncError::Disconnected`] when the
    /// peer is gone.
    async fn send(&mut self, message: ServerMessage) -> Result<(), SyncError>;

    async fn close(&mut self);
}

/// In-memory transport backed by two channels.
pub struct ChannelTransport {
    inbound: mpsc::Receiver<ClientMessage>,
    outbound: mpsc::Sender<ServerMessage>,
}

/// The client's half of a [`ChannelTransport`].
pub struct ChannelPeer {
    pub outgoing: mpsc::Sender<ClientMessage>,
    pub incoming: mpsc::Receiver<ServerMessage>,
}

impl ChannelTransport {
    pub fn pair(buffer: usize) -> (Self, ChannelPeer) {
        let (client_tx, server_rx) = mpsc::channel(buffer);
        let (server_tx, client_rx) = mpsc::channel(buffer);
        (
            Self {
                inbound: server_rx,
                outbound: server_tx,
            },
            ChannelPeer {
                outgoing: client_tx,
                incoming: client_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&mut self) -> Option<Result<ClientMessage, SyncError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, message: ServerMessage) -> Result<(), SyncError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SyncError::Disconnected("peer dropped".into()))
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
