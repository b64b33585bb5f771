//! sqlx error classification into pipeline reason codes.

use anyhow::anyhow;
use wordloom_core::error::{ErrorReason, WordloomError};

/// SQLSTATE → reason. `None` means "not a known transient condition".
fn reason_for(err: &sqlx::Error) -> Option<ErrorReason> {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code()?;
            match code.as_ref() {
                "40P01" => Some(ErrorReason::DbDeadlock),
                // serialization_failure, unique_violation, lock_not_available
                "40001" | "23505" | "55P03" => Some(ErrorReason::DbConflict),
                c if c.starts_with("08") || c.starts_with("57P") || c == "53300" => {
                    Some(ErrorReason::DbUnavailable)
                }
                _ => None,
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => Some(ErrorReason::DbUnavailable),
        _ => None,
    }
}

/// Map a sqlx error into the core error type, keeping transient codes.
pub fn db_err(err: sqlx::Error) -> WordloomError {
    match reason_for(&err) {
        Some(reason) => WordloomError::storage(reason, err.to_string()),
        None => WordloomError::Internal(anyhow!(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_unavailable() {
        let err = db_err(sqlx::Error::PoolTimedOut);
        assert_eq!(err.reason(), ErrorReason::DbUnavailable);
    }

    #[test]
    fn row_not_found_is_internal() {
        let err = db_err(sqlx::Error::RowNotFound);
        assert!(matches!(err, WordloomError::Internal(_)));
        assert_eq!(err.reason(), ErrorReason::Unhandled);
    }
}
