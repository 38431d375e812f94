//! Error types for the tenant data-access core.

use std::time::Duration;

use thiserror::Error;

use crate::engine::RowId;
use crate::optimistic::Version;

/// Library-local result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Typed error for the pool, the scope manager and the concurrency protocols.
#[derive(Debug, Error)]
pub enum DbError {
    /// The caller supplied a tenant id that is invalid or unknown.
    #[error("tenant resolution failed: {0}")]
    TenantResolution(String),

    /// No connection became available within the pool's wait budget.
    #[error("connection pool exhausted: no connection available within {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    /// The storage engine reported a serialization failure, deadlock or lock timeout.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// A conditional write lost against a concurrent editor.
    #[error(
        "{table}/{id} was modified concurrently (expected version {expected}, current version {current})"
    )]
    OptimisticConflict {
        table: String,
        id: RowId,
        expected: Version,
        current: Version,
    },

    #[error("{table}/{id} not found")]
    NotFound { table: String, id: RowId },

    /// Resetting a connection's scoping attribute failed; the connection is discarded.
    #[error("failed to reset connection scope: {0}")]
    CleanupFailure(String),

    #[error("nested transactions are not supported; reuse the enclosing transaction handle")]
    NestedTransaction,

    #[error("a new connection was requested inside an open transaction")]
    ConnRequestedInsideTx,

    #[error("invalid lock request: {0}")]
    InvalidLockRequest(String),

    #[error("scope violation: {0}")]
    ScopeViolation(String),

    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Config(#[from] Box<figment::Error>),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "pg")]
    #[error(transparent)]
    Sqlx(sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<figment::Error> for DbError {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

/// SQLSTATE codes that mean "re-run the whole transaction".
#[cfg(feature = "pg")]
const RETRYABLE_SQLSTATES: [&str; 3] = ["40001", "40P01", "55P03"];

#[cfg(feature = "pg")]
impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            let code = db.code();
            if code
                .as_deref()
                .is_some_and(|c| RETRYABLE_SQLSTATES.contains(&c))
            {
                return Self::TransactionConflict(db.message().to_owned());
            }
        }
        Self::Sqlx(e)
    }
}

/// Caller-facing classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is wrong; retrying does not help.
    Rejected,
    NotFound,
    /// Someone else changed the record; reload and resubmit.
    Conflict,
    /// Safe to retry with backoff.
    Transient,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Rejected => "the request was rejected",
            Self::NotFound => "the requested record does not exist",
            Self::Conflict => "the record was modified by someone else; reload and retry",
            Self::Transient => "temporary failure; please retry",
            Self::Internal => "internal error",
        }
    }
}

impl DbError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TenantResolution(_)
            | Self::ScopeViolation(_)
            | Self::InvalidLockRequest(_)
            | Self::InvalidIdentifier(_) => ErrorKind::Rejected,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::OptimisticConflict { .. } => ErrorKind::Conflict,
            Self::PoolExhausted { .. } | Self::TransactionConflict(_) => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        }
    }

    /// True when the transaction boundary may re-run the unit of work.
    #[must_use]
    pub fn is_transaction_conflict(&self) -> bool {
        matches!(self, Self::TransactionConflict(_))
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Error type a unit of work may return.
///
/// The coordinator converts its own failures with `From<DbError>` and inspects
/// returned errors through [`UnitOfWorkError::as_db_error`] to decide whether a
/// transaction conflict should be retried.
pub trait UnitOfWorkError: From<DbError> + Send + 'static {
    fn as_db_error(&self) -> Option<&DbError>;
}

impl UnitOfWorkError for DbError {
    fn as_db_error(&self) -> Option<&DbError> {
        Some(self)
    }
}

impl UnitOfWorkError for anyhow::Error {
    fn as_db_error(&self) -> Option<&DbError> {
        self.downcast_ref::<DbError>()
    }
}
