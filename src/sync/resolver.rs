//! Conflict resolution for concurrent changes to one entity.
//!
//! A change overlaps the entity's last applied event when the client's
//! `base_cursor` is older than that event. Overlapping deletes always win;
//! overlapping updates fall back to last-writer-wins ordered by
//! `(server_timestamp, device_id, event_id)`, which is total, so every
//! instance picks the same winner for the same pair.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::error::{ErrorCode, SyncError};
use crate::models::{EntityHead, Operation, SyncEvent};

/// Version coordinates of one change, as compared by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version<'a> {
    pub operation: Operation,
    pub server_timestamp: DateTime<Utc>,
    pub device_id: &'a str,
    pub event_id: i64,
}

impl<'a> Version<'a> {
    pub fn of_event(event: &'a SyncEvent) -> Self {
        Self {
            operation: event.operation,
            server_timestamp: event.server_timestamp,
            device_id: &event.originating_device_id,
            event_id: event.event_id,
        }
    }

    pub fn of_head(head: &'a EntityHead) -> Self {
        Self {
            operation: head.last_operation,
            server_timestamp: head.last_server_timestamp,
            device_id: &head.last_device_id,
            event_id: head.last_event_id,
        }
    }

    fn lww_cmp(&self, other: &Self) -> Ordering {
        (self.server_timestamp, self.device_id, self.event_id).cmp(&(
            other.server_timestamp,
            other.device_id,
            other.event_id,
        ))
    }
}

/// Which side of a pairwise decision won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    First,
    Second,
}

/// Picks the winner between two concurrent versions of one entity.
///
/// Deletes beat non-deletes; otherwise the greater LWW key wins. The result
/// does not depend on argument order.
pub fn decide(first: &Version<'_>, second: &Version<'_>) -> Winner {
    let first_deletes = first.operation == Operation::Delete;
    let second_deletes = second.operation == Operation::Delete;
    match (first_deletes, second_deletes) {
        (true, false) => Winner::First,
        (false, true) => Winner::Second,
        _ => match first.lww_cmp(second) {
            Ordering::Less => Winner::Second,
            _ => Winner::First,
        },
    }
}

/// An incoming change about to be appended.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub version: Version<'a>,
    /// Cursor the client had applied when it produced the change.
    pub base_cursor: i64,
    /// The user's max cursor before this change.
    pub max_cursor: i64,
}

/// Why a change was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub reason: String,
}

impl Rejection {
    fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl From<Rejection> for SyncError {
    fn from(r: Rejection) -> Self {
        match r.code {
            ErrorCode::ValidationFailed => SyncError::Validation(r.reason),
            code => SyncError::Conflict {
                code,
                reason: r.reason,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Apply,
    Reject(Rejection),
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    max_cursor_lag: i64,
}

impl ConflictResolver {
    pub fn new(max_cursor_lag: i64) -> Self {
        Self { max_cursor_lag }
    }

    /// Decides whether `candidate` may be applied on top of `head`.
    pub fn resolve(&self, candidate: &Candidate<'_>, head: Option<&EntityHead>) -> Resolution {
        use Operation::*;

        if candidate.base_cursor < 0 || candidate.base_cursor > candidate.max_cursor {
            return reject(
                ErrorCode::ValidationFailed,
                format!(
                    "base cursor {} is outside the log (max {})",
                    candidate.base_cursor, candidate.max_cursor
                ),
            );
        }

        let op = candidate.version.operation;
        let Some(head) = head else {
            return match op {
                Create => Resolution::Apply,
                Update | Delete => reject(ErrorCode::ValidationFailed, "entity does not exist"),
            };
        };

        let overlapping = candidate.base_cursor < head.last_event_id;

        if head.deleted {
            return match op {
                Delete => Resolution::Apply,
                Create if !overlapping => Resolution::Apply,
                Create | Update => reject(
                    ErrorCode::ConflictDeleteWins,
                    format!("entity was deleted by event {}", head.last_event_id),
                ),
            };
        }

        match op {
            Create => reject(ErrorCode::ValidationFailed, "entity already exists"),
            Delete => Resolution::Apply,
            Update if !overlapping => Resolution::Apply,
            Update => {
                if head.last_event_id - candidate.base_cursor > self.max_cursor_lag {
                    return reject(
                        ErrorCode::StaleCursor,
                        format!(
                            "base cursor {} is too far behind entity version {}",
                            candidate.base_cursor, head.last_event_id
                        ),
                    );
                }
                match decide(&candidate.version, &Version::of_head(head)) {
                    Winner::First => Resolution::Apply,
                    Winner::Second => reject(
                        ErrorCode::StaleCursor,
                        format!("superseded by event {}", head.last_event_id),
                    ),
                }
            }
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(10_000)
    }
}

fn reject(code: ErrorCode, reason: impl Into<String>) -> Resolution {
    Resolution::Reject(Rejection::new(code, reason))
}
