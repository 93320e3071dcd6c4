//! WebSocket transport for sync sessions.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};

use crate::error::SyncError;
use crate::sync::{ClientMessage, ServerMessage, Transport};

/// JSON text frames over an upgraded axum WebSocket.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&mut self) -> Option<Result<ClientMessage, SyncError>> {
        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(SyncError::Disconnected(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(ClientMessage::decode(text.as_str())),
                Message::Binary(_) => {
                    return Some(Err(SyncError::Protocol(
                        "binary frames are not supported".into(),
                    )))
                }
                Message::Close(_) => return None,
                // Pings are answered by axum.
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    async fn send(&mut self, message: ServerMessage) -> Result<(), SyncError> {
        let text = message.encode()?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SyncError::Disconnected(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}
