//! Error types for the desired-state store.

use std::io;

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// SQLSTATE raised by PostgreSQL while it is starting up or recovering
/// (`cannot_connect_now`).
pub const PG_CANNOT_CONNECT_NOW: &str = "57P03";

/// Errors that can occur while talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// How a store failure should be treated by callers that may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The store is not accepting connections yet.
    TransientConnection,
    /// The store accepted the connection but is starting up or recovering.
    TransientRecovering,
    /// Anything else. Retrying will not help.
    Fatal,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorKind::Fatal)
    }
}

impl StoreError {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Database(e) => classify(e),
            StoreError::Migrate(_) => ErrorKind::Fatal,
        }
    }
}

/// Classify a driver error by inspecting its structured form.
pub fn classify(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Io(e) => classify_io(e.kind()),
        sqlx::Error::PoolTimedOut => ErrorKind::TransientConnection,
        sqlx::Error::Database(db) => classify_code(db.code().as_deref()),
        _ => ErrorKind::Fatal,
    }
}

/// Classify an I/O failure raised while connecting.
pub fn classify_io(kind: io::ErrorKind) -> ErrorKind {
    match kind {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => ErrorKind::TransientConnection,
        _ => ErrorKind::Fatal,
    }
}

/// Classify a SQLSTATE returned by the server.
pub fn classify_code(code: Option<&str>) -> ErrorKind {
    match code {
        Some(PG_CANNOT_CONNECT_NOW) => ErrorKind::TransientRecovering,
        _ => ErrorKind::Fatal,
    }
}
