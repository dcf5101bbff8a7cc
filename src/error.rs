//! Storage Error Taxonomy
//!
//! Every storage operation in reapkv reports failures through [`StoreError`].
//! The reaper does not surface errors to a caller; it classifies them:
//!
//! - **Benign**: `NotFound` is a no-op at every layer.
//! - **Handle-dead**: the handle must be evicted and reopened.
//! - **Lock conflict**: a writer holds the key; retry next tick.
//! - **Retryable**: open failures that only delay reaping.
//! - **Fatal to the cycle**: everything else, including malformed records.
//!
//! Each variant carries a short, stable code (see [`StoreError::code`]) that
//! log events attach as the `code` field.

use thiserror::Error;

/// Errors reported by the storage engine and the expiry index.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key (or cursor position) does not exist
    #[error("key not found")]
    NotFound,

    /// The named database has not been created yet
    #[error("database does not exist: {0}")]
    NoSuchDatabase(String),

    /// The handle was invalidated, typically by a replication role change
    #[error("handle is dead: {0}")]
    HandleDead(String),

    /// Another transaction holds a conflicting lock
    #[error("lock not granted on {db}")]
    LockNotGranted { db: String },

    /// The environment cannot serve the request yet
    #[error("environment not ready: {0}")]
    NotReady(String),

    /// A stored record could not be decoded
    #[error("malformed record in {db}: {reason}")]
    Malformed { db: String, reason: String },

    /// The caller passed an argument the engine cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The transaction was already committed or aborted
    #[error("transaction already finished")]
    TxnFinished,
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Short stable code for log events.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound => "not_found",
            StoreError::NoSuchDatabase(_) => "not_exist",
            StoreError::HandleDead(_) => "rep_dead",
            StoreError::LockNotGranted { .. } => "lockout",
            StoreError::NotReady(_) => "not_ready",
            StoreError::Malformed { .. } => "malformed",
            StoreError::InvalidArgument(_) => "inval",
            StoreError::TxnFinished => "txn_done",
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    #[inline]
    pub fn is_handle_dead(&self) -> bool {
        matches!(self, StoreError::HandleDead(_))
    }

    /// Returns true if another transaction holds the lock. The work can be
    /// retried as is; no handle needs reopening.
    #[inline]
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, StoreError::LockNotGranted { .. })
    }

    /// Returns true for failures that only delay work and are worth retrying
    /// at the next opportunity.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::NoSuchDatabase(_)
                | StoreError::NotReady(_)
                | StoreError::LockNotGranted { .. }
                | StoreError::HandleDead(_)
        )
    }

    pub(crate) fn malformed(db: &str, reason: impl Into<String>) -> Self {
        StoreError::Malformed {
            db: db.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(StoreError::NotFound.code(), "not_found");
        assert_eq!(StoreError::HandleDead("t.db".into()).code(), "rep_dead");
        assert_eq!(StoreError::NoSuchDatabase("t.db".into()).code(), "not_exist");
        assert_eq!(StoreError::malformed("__expire.db", "short").code(), "malformed");
    }

    #[test]
    fn test_classification() {
        assert!(StoreError::NotFound.is_not_found());
        assert!(!StoreError::TxnFinished.is_not_found());
        assert!(StoreError::LockNotGranted { db: "x".into() }.is_lock_conflict());
        assert!(!StoreError::HandleDead("x".into()).is_lock_conflict());
        assert!(StoreError::HandleDead("x".into()).is_handle_dead());
        assert!(StoreError::NotReady("x".into()).is_retryable());
        assert!(!StoreError::malformed("x", "y").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = StoreError::malformed("__expire.db", "key too short");
        assert_eq!(
            err.to_string(),
            "malformed record in __expire.db: key too short"
        );
    }
}
