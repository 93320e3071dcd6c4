//! Error taxonomy shared by the storage layer and the sync protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::auth::AuthError;

/// Codes surfaced to clients in `ERROR` and `CHANGE_REJECTED` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    StaleCursor,
    ConflictDeleteWins,
    StorageUnavailable,
    ValidationFailed,
    ProtocolError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::StaleCursor => "STALE_CURSOR",
            ErrorCode::ConflictDeleteWins => "CONFLICT_DELETE_WINS",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Primary SQLite result codes; extended codes carry them in the low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Errors raised by the SQLite-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not serve the request.
    #[error("Storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// Schema migration failed at startup.
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
            StoreError::Unavailable(
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed,
            ) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Errors produced while serving one sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Token rejected; terminal for the connection.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A single change is malformed or refers to an impossible state.
    #[error("Invalid change: {0}")]
    Validation(String),

    /// A single change lost conflict resolution; the client must resync.
    #[error("Change rejected ({code}): {reason}")]
    Conflict { code: ErrorCode, reason: String },

    /// Storage failed after retries were exhausted.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Malformed or out-of-order frame; terminal for the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport failed underneath the session.
    #[error("Connection lost: {0}")]
    Disconnected(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Auth(_) => ErrorCode::AuthFailed,
            SyncError::Validation(_) => ErrorCode::ValidationFailed,
            SyncError::Conflict { code, .. } => *code,
            SyncError::Storage(_) => ErrorCode::StorageUnavailable,
            SyncError::Protocol(_) | SyncError::Disconnected(_) => ErrorCode::ProtocolError,
        }
    }

    /// Whether the session must close after reporting this error.
    ///
    /// Storage errors reach the session only once retries are exhausted, so
    /// they close it too; the client reconnects from its last acknowledged
    /// cursor.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_)
                | SyncError::Protocol(_)
                | SyncError::Storage(_)
                | SyncError::Disconnected(_)
        )
    }

    pub fn stale_cursor(reason: impl Into<String>) -> Self {
        SyncError::Conflict {
            code: ErrorCode::StaleCursor,
            reason: reason.into(),
        }
    }

    pub fn delete_wins(reason: impl Into<String>) -> Self {
        SyncError::Conflict {
            code: ErrorCode::ConflictDeleteWins,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ConflictDeleteWins).unwrap();
        assert_eq!(json, "\"CONFLICT_DELETE_WINS\"");
        assert_eq!(ErrorCode::StorageUnavailable.to_string(), "STORAGE_UNAVAILABLE");
    }

    #[test]
    fn test_sync_error_codes() {
        assert_eq!(SyncError::stale_cursor("behind").code(), ErrorCode::StaleCursor);
        assert_eq!(SyncError::delete_wins("gone").code(), ErrorCode::ConflictDeleteWins);
        assert_eq!(
            SyncError::Validation("bad".into()).code(),
            ErrorCode::ValidationFailed
        );
        assert_eq!(
            SyncError::Auth(AuthError::InvalidToken).code(),
            ErrorCode::AuthFailed
        );
    }

    #[test]
    fn test_only_connection_level_errors_close_session() {
        assert!(SyncError::Protocol("garbage".into()).closes_session());
        assert!(SyncError::Auth(AuthError::Expired).closes_session());
        assert!(SyncError::Storage(StoreError::Corrupt("x".into())).closes_session());
        assert!(!SyncError::Validation("bad".into()).closes_session());
        assert!(!SyncError::stale_cursor("behind").closes_session());
    }

    #[test]
    fn test_pool_timeout_is_retryable() {
        assert!(StoreError::Unavailable(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!StoreError::Corrupt("bad json".into()).is_retryable());
        assert!(!StoreError::Unavailable(sqlx::Error::RowNotFound).is_retryable());
    }

    #[tokio::test]
    async fn test_constraint_failures_are_not_retried() {
        let (pool, _temp) = crate::db::test_pool().await;
        let err = sqlx::query("INSERT INTO user_cursors (user_id, last_event_id) VALUES (NULL, 1)")
            .execute(&pool)
            .await
            .unwrap_err();
        assert!(!StoreError::from(err).is_retryable());
    }

    #[tokio::test]
    async fn test_busy_database_is_retryable() {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use sqlx::{ConnectOptions, Connection};

        let (pool, temp) = crate::db::test_pool().await;
        let mut holder = pool.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *holder)
            .await
            .unwrap();

        let mut other = SqliteConnectOptions::new()
            .filename(temp.path().join("test.db"))
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::ZERO)
            .connect()
            .await
            .unwrap();
        let err = sqlx::query("INSERT INTO user_cursors (user_id, last_event_id) VALUES ('bob', 1)")
            .execute(&mut other)
            .await
            .unwrap_err();
        assert!(StoreError::from(err).is_retryable());

        sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
        other.close().await.unwrap();
    }
}
