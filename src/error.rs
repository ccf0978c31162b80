// 🚨 Error Kinds - What can go wrong while reconciling the store
//
// Per-group failures are isolated by the passes. Only the fatal kinds
// (cancellation, an unavailable store, a lost worker) cross a pass boundary.

use thiserror::Error;

use crate::passes::PassKind;

#[derive(Error, Debug)]
pub enum CleansingError {
    /// A transactional context could not be opened. Fatal to the current run.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A concurrent writer held the rows we needed. Retried per group.
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Cooperative cancellation was requested between groups.
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// The backing store type has no reclaim operation.
    #[error("Store maintenance unsupported for {0} stores")]
    MaintenanceUnsupported(&'static str),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking store worker panicked or was aborted.
    #[error("Store worker failed: {0}")]
    Worker(String),

    /// One or more passes failed. Maintenance still ran; its own failure,
    /// if any, rides along.
    #[error("{} reconciliation pass(es) failed: {}{}", .failures.len(), summarize(.failures), maintenance_note(.maintenance))]
    PassesFailed {
        failures: Vec<PassFailure>,
        maintenance: Option<String>,
    },
}

/// One failed pass inside an aggregate failure
#[derive(Debug, Clone, PartialEq)]
pub struct PassFailure {
    pub pass: PassKind,
    pub message: String,
}

fn summarize(failures: &[PassFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.pass.as_str(), f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn maintenance_note(maintenance: &Option<String>) -> String {
    match maintenance {
        Some(reason) => format!("; maintenance: {}", reason),
        None => String::new(),
    }
}

impl CleansingError {
    /// Conflicts are the only kind worth retrying immediately
    pub fn is_conflict(&self) -> bool {
        matches!(self, CleansingError::TransactionConflict(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CleansingError::Cancelled)
    }

    /// Ends the whole pass instead of just the group that hit it
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CleansingError::Cancelled | CleansingError::StoreUnavailable(_) | CleansingError::Worker(_)
        )
    }
}

impl From<rusqlite::Error> for CleansingError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err {
            rusqlite::Error::SqliteFailure(ref failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    CleansingError::TransactionConflict(err.to_string())
                }
                ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied => {
                    CleansingError::StoreUnavailable(err.to_string())
                }
                _ => CleansingError::Sqlite(err),
            },
            other => CleansingError::Sqlite(other),
        }
    }
}

impl From<tokio::task::JoinError> for CleansingError {
    fn from(err: tokio::task::JoinError) -> Self {
        CleansingError::Worker(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CleansingError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_and_locked_are_conflicts() {
        let busy: CleansingError = sqlite_failure(rusqlite::ffi::SQLITE_BUSY).into();
        let locked: CleansingError = sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).into();

        assert!(busy.is_conflict());
        assert!(locked.is_conflict());
    }

    #[test]
    fn test_cannot_open_is_store_unavailable() {
        let err: CleansingError = sqlite_failure(rusqlite::ffi::SQLITE_CANTOPEN).into();
        assert!(matches!(err, CleansingError::StoreUnavailable(_)));
    }

    #[test]
    fn test_other_failures_stay_sqlite() {
        let err: CleansingError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, CleansingError::Sqlite(_)));
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_passes_failed_message_lists_passes() {
        let err = CleansingError::PassesFailed {
            failures: vec![
                PassFailure { pass: PassKind::Account, message: "boom".to_string() },
                PassFailure { pass: PassKind::DataAsset, message: "bang".to_string() },
            ],
            maintenance: None,
        };

        let message = err.to_string();
        assert!(message.starts_with("2 reconciliation pass(es) failed"));
        assert!(message.contains("account: boom"));
        assert!(message.contains("data_asset: bang"));
        assert!(!message.contains("maintenance"));
    }

    #[test]
    fn test_passes_failed_message_keeps_maintenance_failure() {
        let err = CleansingError::PassesFailed {
            failures: vec![PassFailure { pass: PassKind::User, message: "bad row".to_string() }],
            maintenance: Some("disk full".to_string()),
        };

        assert!(err.to_string().ends_with("user: bad row; maintenance: disk full"));
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(CleansingError::Cancelled.is_fatal());
        assert!(CleansingError::StoreUnavailable("gone".to_string()).is_fatal());
        assert!(CleansingError::Worker("panicked".to_string()).is_fatal());

        assert!(!CleansingError::TransactionConflict("busy".to_string()).is_fatal());
        let corrupt: CleansingError =
            rusqlite::Error::InvalidColumnType(4, "preferences".to_string(), rusqlite::types::Type::Text).into();
        assert!(!corrupt.is_fatal());
    }
}
