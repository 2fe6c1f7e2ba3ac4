//! Error types for Tally

use thiserror::Error;

use crate::command::ValidationErrors;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Action not supported: {0}")]
    ActionNotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Idempotency key collision: the command already exists.
    #[error("Duplicate command: command {0} already exists for this idempotency key")]
    Duplicate(i64),

    /// A lock_version-guarded write affected zero rows.
    #[error("Stale version: {0}")]
    StaleVersion(String),

    /// Another processor claimed the queue item first.
    #[error("Queue item {0} already claimed by another processor")]
    AlreadyClaimed(i64),

    #[error("Negative balance: account {address} available would drop to {available}")]
    NegativeBalance { address: String, available: i64 },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Instance in use: {0}")]
    InstanceInUse(String),

    /// Synchronous processing did not reach `processed`; the command is
    /// persisted and the queue item carries the diagnostics.
    #[error("Command {command_id} did not process: {reason}")]
    CommandFailed { command_id: i64, reason: String },
}

impl Error {
    /// Whether this error is the stale-row signal the OCC retry engine
    /// handles. Everything else bubbles out of the retry loop.
    pub fn is_occ_conflict(&self) -> bool {
        matches!(self, Error::StaleVersion(_))
    }

    /// Whether this error is terminal for a command: retrying cannot help,
    /// so the queue item dead-letters instead of scheduling a retry.
    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::NotFound(_)
                | Error::NegativeBalance { .. }
                | Error::InvalidTransition(_)
                | Error::ActionNotSupported(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_version_is_occ_conflict() {
        let err = Error::StaleVersion("accounts id=1".to_string());
        assert!(err.is_occ_conflict());
        assert!(!err.is_hard_failure());
    }

    #[test]
    fn validation_is_hard_failure() {
        let err = Error::Validation(ValidationErrors::single("payload", "is invalid"));
        assert!(err.is_hard_failure());
        assert!(!err.is_occ_conflict());
    }

    #[test]
    fn database_error_is_neither() {
        let err = Error::Database(rusqlite::Error::ExecuteReturnedResults);
        assert!(!err.is_hard_failure());
        assert!(!err.is_occ_conflict());
    }
}
