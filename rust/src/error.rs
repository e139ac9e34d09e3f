//! Error types for the sync engine and its collaborators.

use thiserror::Error;

/// Recoverable failures surfaced to the caller of a core operation.
///
/// Nothing here is fatal: the actor reports these as a toast and keeps
/// running with its local state intact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The durable write for a message failed. The message stays visible locally.
    #[error("could not save message {message_id}: {reason}")]
    DurablePersistFailed { message_id: String, reason: String },

    /// A scheduled send asked for a time that is not in the future.
    #[error("scheduled time must be in the future")]
    ScheduleInPast { scheduled_for: i64, now: i64 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("message {message_id} not found in {chat_id}")]
    MessageNotFound { chat_id: String, message_id: String },

    #[error("conversation is blocked: {0}")]
    ConversationBlocked(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("message is empty")]
    EmptyMessage,
}

/// Failures of the durable document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Failures of the relay transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay connection closed")]
    Closed,

    #[error("could not encode relay frame: {0}")]
    Encode(String),
}

/// Failures of the local key-value cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_error_display() {
        let err = SyncError::DurablePersistFailed {
            message_id: "m1".to_string(),
            reason: "offline".to_string(),
        };
        assert_eq!(err.to_string(), "could not save message m1: offline");

        let err = SyncError::ScheduleInPast {
            scheduled_for: 1,
            now: 2,
        };
        assert_eq!(err.to_string(), "scheduled time must be in the future");
    }

    #[test]
    fn store_error_from_sqlite() {
        let err: StoreError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, StoreError::Database(_)));
        assert!(err.to_string().starts_with("database error:"));
    }
}
