//! Error taxonomy for cash-session operations.
//!
//! Engine, ledger and linker functions return [`CashError`]; the JSON command
//! layer turns it into a [`Toast`] (stable code + human-readable message) for
//! the frontend.

use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CashError {
    /// Malformed input, rejected before any write.
    #[error("{0}")]
    Validation(String),

    /// Would break the one-open-session-per-operator rule.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Authorization(String),

    /// Transition not allowed from the current state.
    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    NotFound(String),

    /// Operation allowed for the actor but not from this flow.
    #[error("{0}")]
    PolicyViolation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, CashError>;

impl CashError {
    pub fn code(&self) -> &'static str {
        match self {
            CashError::Validation(_) => "validation",
            CashError::Conflict(_) => "conflict",
            CashError::Authorization(_) => "authorization",
            CashError::InvalidState(_) => "invalid_state",
            CashError::NotFound(_) => "not_found",
            CashError::PolicyViolation(_) => "policy_violation",
            CashError::Database(_) => "database",
            CashError::Storage(_) => "storage",
        }
    }

    /// SQLite busy/locked failures clear up on their own; everything else is
    /// reported straight away.
    pub fn is_transient(&self) -> bool {
        match self {
            CashError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// The client view is stale and should be refetched in the background.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, CashError::InvalidState(_) | CashError::NotFound(_))
    }

    pub fn toast(&self) -> Toast {
        let message = match self {
            CashError::Database(_) | CashError::Storage(_) => {
                "Could not reach the register data. Try again.".to_string()
            }
            other => other.to_string(),
        };
        Toast {
            kind: "error",
            code: self.code(),
            message,
            refresh: self.needs_refresh(),
            retryable: self.is_transient(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for CashError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        CashError::Storage(format!("connection lock poisoned: {e}"))
    }
}

/// User-facing notification for a failed or denied operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Toast {
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
    pub refresh: bool,
    pub retryable: bool,
}

/// True when `err` is a UNIQUE constraint failure (e.g. the partial index that
/// allows one open session per operator).
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> CashError {
        CashError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn test_busy_is_transient() {
        assert!(busy().is_transient());
        assert!(!CashError::Conflict("x".into()).is_transient());
        assert!(!CashError::Database(rusqlite::Error::QueryReturnedNoRows).is_transient());
    }

    #[test]
    fn test_refresh_only_for_stale_views() {
        assert!(CashError::InvalidState("closed".into()).needs_refresh());
        assert!(CashError::NotFound("gone".into()).needs_refresh());
        assert!(!CashError::Authorization("no".into()).needs_refresh());
    }

    #[test]
    fn test_toast_hides_database_details() {
        let toast = busy().toast();
        assert_eq!(toast.code, "database");
        assert!(toast.retryable);
        assert!(!toast.message.contains("SQLITE"));

        let toast = CashError::PolicyViolation("Edit this sale from the register".into()).toast();
        assert_eq!(toast.code, "policy_violation");
        assert_eq!(toast.message, "Edit this sale from the register");
    }
}
