//! Error taxonomy for the Aqua POS backend.
//!
//! Every fallible public function in the crate returns [`Result`]. The
//! variants mirror how failures are surfaced to the operator: validation
//! and input-shape problems abort the operation with no state change,
//! `NotFound` is a serial lookup miss, and `Duplicate` marks a unique-key
//! collision (recovered internally for customer names, surfaced for
//! sign-up emails).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value failed validation (empty customer name,
    /// negative ledger amount). The operation was aborted with no state
    /// change.
    #[error("{0}")]
    Validation(String),

    /// A numeric input was not a usable number (NaN or infinite).
    #[error("{0}")]
    InvalidInput(String),

    /// No bill exists with the requested serial.
    #[error("bill #{0} not found")]
    NotFound(i64),

    /// Unique-key collision on insert.
    #[error("{0} already exists")]
    Duplicate(String),

    /// Login failed, the session is missing or expired, or the terminal
    /// is locked out after repeated failed attempts.
    #[error("{0}")]
    Unauthorized(String),

    /// Underlying SQLite failure.
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),

    /// A connection lock was poisoned by a panicking thread.
    #[error("database lock poisoned")]
    Poisoned,

    /// Infrastructure failure outside the database (password hashing,
    /// invoice rendering).
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether a rusqlite error is a UNIQUE constraint violation.
///
/// Used to translate insert races into [`Error::Duplicate`] instead of a
/// generic database error.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::Validation("customer name is required".into()).to_string(),
            "customer name is required"
        );
        assert_eq!(Error::NotFound(42).to_string(), "bill #42 not found");
        assert_eq!(
            Error::Duplicate("email".into()).to_string(),
            "email already exists"
        );
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = rusqlite::Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("CREATE TABLE t (v TEXT UNIQUE);")
            .expect("create table");
        conn.execute("INSERT INTO t (v) VALUES ('x')", [])
            .expect("first insert");
        let err = conn
            .execute("INSERT INTO t (v) VALUES ('x')", [])
            .expect_err("second insert must collide");
        assert!(is_unique_violation(&err));
    }
}
