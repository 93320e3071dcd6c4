//! Sync core: protocol, conflict resolution and per-connection sessions.
//!
//! [`SyncEngine`] holds what every session shares (stores, bus, auth, the
//! per-user append locks). [`SyncSession`] drives one connection through
//! `AUTH`, `HELLO`, the catch-up batch and live streaming.

pub mod engine;
pub mod protocol;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod transport;

pub use engine::{HandshakeBatch, SessionTimeouts, SyncEngine};
pub use protocol::{ChangeRequest, ClientMessage, ServerMessage, SuggestedAction};
pub use resolver::{ConflictResolver, Rejection, Resolution};
pub use retry::RetryPolicy;
pub use session::{SessionOutcome, SessionState, SyncSession};
pub use transport::{ChannelPeer, ChannelTransport, Transport};
