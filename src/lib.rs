//! Real-time cross-device synchronization for a self-hosted bookmark manager.
//!
//! Every accepted change becomes an event in the user's append-only log with
//! a contiguous, per-user `event_id`. Connected devices receive events live
//! in id order; devices that were away catch up from their offline queue and
//! the log when they reconnect.

pub mod auth;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod server;
pub mod sync;
