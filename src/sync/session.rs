//! Per-connection protocol state machine.
//!
//! ```text
//! Connecting -> Authenticating -> Handshaking -> Streaming <-> Backpressured
//!                     |                              |
//!                     +-------> Closed <- Closing <--+
//! ```
//!
//! A session owns its transport and one bus subscription. It subscribes
//! before reading the log during the handshake, forwards live events in
//! strict `event_id` order, and falls back to the Delta Store whenever the
//! live stream shows a gap or reports lag.

use std::fmt;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

use super::engine::SyncEngine;
use super::protocol::{ChangeRequest, ClientMessage, ServerMessage};
use super::transport::Transport;
use crate::auth::{AuthError, Claims};
use crate::bus::{BusRecv, Subscription};
use crate::error::{ErrorCode, SyncError};
use crate::models::{DeviceIdentity, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Handshaking,
    Streaming,
    Backpressured,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Handshaking => "handshaking",
            SessionState::Streaming => "streaming",
            SessionState::Backpressured => "backpressured",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub identity: Option<DeviceIdentity>,
    /// Highest event id written to the client.
    pub last_sent: i64,
    /// Code of the error that ended the session, if any.
    pub error: Option<ErrorCode>,
    /// States visited, in order.
    pub states: Vec<SessionState>,
}

enum Step {
    Inbound(Option<Result<ClientMessage, SyncError>>),
    Bus(BusRecv),
    Heartbeat,
}

pub struct SyncSession<T> {
    engine: Arc<SyncEngine>,
    transport: T,
    state: SessionState,
    states: Vec<SessionState>,
    identity: Option<DeviceIdentity>,
    last_sent: i64,
    session_id: Uuid,
}

impl<T: Transport> SyncSession<T> {
    pub fn new(engine: Arc<SyncEngine>, transport: T) -> Self {
        Self {
            engine,
            transport,
            state: SessionState::Connecting,
            states: vec![SessionState::Connecting],
            identity: None,
            last_sent: 0,
            session_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serves the connection until it closes.
    pub async fn run(mut self) -> SessionOutcome {
        let span = tracing::info_span!("sync_session", session_id = %self.session_id);
        async move {
            let result = self.drive().await;

            let error = match result {
                Ok(()) => None,
                Err(e) => {
                    let code = e.code();
                    self.fail(e).await;
                    Some(code)
                }
            };

            if self.state != SessionState::Closed {
                self.transition(SessionState::Closing);
                if let Some(identity) = &self.identity {
                    self.engine.close_device(identity).await;
                }
                self.transport.close().await;
                self.transition(SessionState::Closed);
            }

            SessionOutcome {
                identity: self.identity,
                last_sent: self.last_sent,
                error,
                states: self.states,
            }
        }
        .instrument(span)
        .await
    }

    async fn fail(&mut self, error: SyncError) {
        match &error {
            SyncError::Disconnected(reason) => {
                tracing::info!(state = %self.state, "connection lost: {}", reason);
                return;
            }
            SyncError::Auth(_) => tracing::warn!("authentication failed: {}", error),
            _ => tracing::warn!(state = %self.state, "closing session: {}", error),
        }

        if let Err(e) = self.transport.send(ServerMessage::error(&error)).await {
            tracing::debug!("could not deliver error frame: {}", e);
        }

        // Unauthenticated connections hold no device state to release.
        if matches!(error, SyncError::Auth(_)) && self.identity.is_none() {
            self.transport.close().await;
            self.transition(SessionState::Closed);
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "session state");
            self.state = next;
            self.states.push(next);
        }
    }

    async fn drive(&mut self) -> Result<(), SyncError> {
        self.transition(SessionState::Authenticating);
        let claims = self.authenticate().await?;

        self.transition(SessionState::Handshaking);
        let (identity, last_cursor) = self.await_hello(&claims).await?;
        self.engine.open_device(&identity).await?;
        self.identity = Some(identity.clone());

        let subscription = self.engine.subscribe(&identity.user_id).await;
        let batch = self.engine.handshake(&identity, last_cursor).await?;

        self.last_sent = last_cursor;
        self.send(ServerMessage::Welcome {
            max_cursor: batch.max_cursor,
        })
        .await?;
        for event in &batch.events {
            self.send_event(event).await?;
        }

        tracing::info!(
            user_id = %identity.user_id,
            device_id = %identity.device_id,
            last_cursor,
            max_cursor = batch.max_cursor,
            sent = batch.events.len(),
            "handshake complete"
        );

        self.transition(SessionState::Streaming);
        self.stream(&identity, subscription).await
    }

    async fn authenticate(&mut self) -> Result<Claims, SyncError> {
        let timeout = self.engine.timeouts().auth;
        let frame = match tokio::time::timeout(timeout, self.transport.recv()).await {
            Ok(frame) => frame,
            Err(_) => return Err(AuthError::Timeout.into()),
        };

        match frame {
            None => Err(SyncError::Disconnected("closed before AUTH".into())),
            Some(Err(e)) => Err(e),
            Some(Ok(ClientMessage::Auth { token })) => self.engine.authenticate(&token).await,
            Some(Ok(other)) => Err(SyncError::Protocol(format!(
                "expected AUTH, got {}",
                other.kind()
            ))),
        }
    }

    async fn await_hello(&mut self, claims: &Claims) -> Result<(DeviceIdentity, i64), SyncError> {
        let timeout = self.engine.timeouts().handshake;
        let frame = match tokio::time::timeout(timeout, self.transport.recv()).await {
            Ok(frame) => frame,
            Err(_) => {
                return Err(SyncError::Protocol(format!(
                    "no HELLO within {}s",
                    timeout.as_secs()
                )))
            }
        };

        match frame {
            None => Err(SyncError::Disconnected("closed before HELLO".into())),
            Some(Err(e)) => Err(e),
            Some(Ok(ClientMessage::Hello {
                device_id,
                last_cursor,
            })) => {
                if device_id.trim().is_empty() {
                    return Err(SyncError::Protocol("empty device_id".into()));
                }
                if last_cursor < 0 {
                    return Err(SyncError::Protocol("negative last_cursor".into()));
                }
                Ok((claims.bind_device(&device_id)?, last_cursor))
            }
            Some(Ok(other)) => Err(SyncError::Protocol(format!(
                "expected HELLO, got {}",
                other.kind()
            ))),
        }
    }

    async fn stream(
        &mut self,
        identity: &DeviceIdentity,
        mut subscription: Subscription,
    ) -> Result<(), SyncError> {
        let period = self.engine.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                frame = self.transport.recv() => Step::Inbound(frame),
                received = subscription.recv() => Step::Bus(received),
                _ = heartbeat.tick() => Step::Heartbeat,
            };

            match step {
                Step::Inbound(None) => {
                    tracing::debug!("client closed the connection");
                    return Ok(());
                }
                Step::Inbound(Some(Err(e))) => return Err(e),
                Step::Inbound(Some(Ok(message))) => self.handle_message(identity, message).await?,
                Step::Bus(BusRecv::Event(event)) => self.forward(identity, &event).await?,
                Step::Bus(BusRecv::Lagged(missed)) => {
                    tracing::warn!(missed, last_sent = self.last_sent, "subscription lagged");
                    self.catch_up(identity).await?;
                }
                Step::Bus(BusRecv::Closed) => {
                    return Err(SyncError::Disconnected("event bus closed".into()))
                }
                Step::Heartbeat => self.engine.refresh_device(identity).await,
            }
        }
    }

    async fn handle_message(
        &mut self,
        identity: &DeviceIdentity,
        message: ClientMessage,
    ) -> Result<(), SyncError> {
        match message {
            ClientMessage::Change(change) => self.handle_change(identity, change).await,
            ClientMessage::Ack { event_id } => {
                if event_id > self.last_sent {
                    return Err(SyncError::Protocol(format!(
                        "ACK {} is beyond last delivered event {}",
                        event_id, self.last_sent
                    )));
                }
                self.engine.acknowledge(identity, event_id).await
            }
            other => Err(SyncError::Protocol(format!(
                "unexpected {} after handshake",
                other.kind()
            ))),
        }
    }

    async fn handle_change(
        &mut self,
        identity: &DeviceIdentity,
        change: ChangeRequest,
    ) -> Result<(), SyncError> {
        let change_id = change.change_id.clone();
        match self.engine.submit_change(identity, change).await {
            Ok(event) => {
                self.send(ServerMessage::ChangeAccepted {
                    change_id,
                    event_id: event.event_id,
                })
                .await
            }
            Err(e) if e.closes_session() => Err(e),
            Err(e) => self.send(ServerMessage::rejected(change_id, &e)).await,
        }
    }

    /// Delivers a live event if it is the next one the client expects.
    async fn forward(&mut self, identity: &DeviceIdentity, event: &SyncEvent) -> Result<(), SyncError> {
        if event.event_id <= self.last_sent {
            tracing::trace!(event_id = event.event_id, "dropping duplicate event");
            return Ok(());
        }
        if event.event_id == self.last_sent + 1 {
            return self.send_event(event).await;
        }

        tracing::debug!(
            event_id = event.event_id,
            last_sent = self.last_sent,
            "gap in live stream"
        );
        self.catch_up(identity).await
    }

    /// Backfills from the log after lag or a gap, then resumes streaming.
    async fn catch_up(&mut self, identity: &DeviceIdentity) -> Result<(), SyncError> {
        self.transition(SessionState::Backpressured);
        let events = self.engine.backfill(&identity.user_id, self.last_sent).await?;
        let count = events.len();
        for event in &events {
            if event.event_id == self.last_sent + 1 {
                self.send_event(event).await?;
            }
        }
        tracing::debug!(backfilled = count, last_sent = self.last_sent, "caught up");
        self.transition(SessionState::Streaming);
        Ok(())
    }

    async fn send_event(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
        self.send(ServerMessage::delta(event)).await?;
        self.last_sent = event.event_id;
        Ok(())
    }

    async fn send(&mut self, message: ServerMessage) -> Result<(), SyncError> {
        self.transport.send(message).await
    }
}
