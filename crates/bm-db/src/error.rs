//! Error taxonomy for the persistence core.
//!
//! Variant set matches the "Error kinds" list one-to-one: Configuration,
//! AlreadyExists, NotReady, Transient backend, Lost connection, Invariant
//! violation. There is deliberately no `NotFound` variant — absence of a row
//! in a `get_*` accessor is the sentinel `None`, never an error.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Malformed database URL, unsupported driver, or a combination of URL
    /// parts that the selected backend does not accept.
    Configuration(String),
    /// `create_db` was called against a database that already has a
    /// `version` table.
    AlreadyExists,
    /// `open_db` was called against a database with no `version` row, or a
    /// `version` other than the one this crate understands.
    NotReady(NotReadyReason),
    /// An operational or programming error surfaced by the backend driver
    /// during a transaction. Never auto-retried.
    Transient(sqlx::Error),
    /// The dedicated synchronous connection failed to roll back after an
    /// error and was dropped; the next call will reconnect.
    LostConnection,
    /// An asserted precondition (non-negative id, presence of a required
    /// state row) did not hold. Always a programmer bug, never a runtime
    /// condition a caller should handle.
    InvariantViolation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    Empty,
    UnsupportedVersion(i64),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Error::AlreadyExists => {
                write!(f, "refusing to touch an existing database")
            }
            Error::NotReady(NotReadyReason::Empty) => {
                write!(f, "cannot use an empty database")
            }
            Error::NotReady(NotReadyReason::UnsupportedVersion(v)) => {
                write!(f, "db is at version {v}, this crate only knows version 1")
            }
            Error::Transient(e) => write!(f, "transient backend error: {e}"),
            Error::LostConnection => {
                write!(f, "dedicated connection lost; will reconnect on next call")
            }
            Error::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transient(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Transient(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
