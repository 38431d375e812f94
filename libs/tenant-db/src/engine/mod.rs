//! Storage-engine contract.
//!
//! The pool, scope manager and transaction coordinator only talk to storage
//! through [`Connector`] and [`StorageConn`]. An engine must provide:
//!
//! - a per-connection scoping attribute that filters rows by tenant, or lifts
//!   the filter under bypass ([`StorageConn::apply_scope`]);
//! - transaction boundaries on a single connection;
//! - an atomic conditional write keyed by id and version
//!   ([`StorageConn::update_if_version`]);
//! - a row-locking primitive that blocks conflicting transactions until
//!   release ([`StorageConn::lock_rows`]).
//!
//! Two engines ship with the crate: [`memory`] (always available, used by the
//! test suite) and `postgres` (feature `pg`).

use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DbError, Result};
use crate::optimistic::{Version, VersionedRecord};
use crate::scope::ScopeState;
use crate::tenant::TenantId;
use crate::tx::TxConfig;

pub mod memory;
#[cfg(feature = "pg")]
pub mod postgres;

/// Primary key of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub i64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Column values of a row, keyed by column name.
pub type Fields = serde_json::Map<String, Value>;

/// Columns owned by the core. Callers never write them directly.
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "tenant_id", "version"];

/// Drops reserved columns from a caller-supplied field set.
#[must_use]
pub fn strip_reserved(mut fields: Fields) -> Fields {
    for col in RESERVED_COLUMNS {
        fields.remove(col);
    }
    fields
}

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap()
});

/// Checks that `name` is safe to splice into a statement as a table or column name.
///
/// # Errors
/// Returns `DbError::InvalidIdentifier` for anything but a plain identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(name.to_owned()))
    }
}

/// Conditional write: update `id` only if its version still equals `expected`.
#[derive(Debug, Clone, Copy)]
pub struct VersionedWrite<'a> {
    pub table: &'a str,
    pub id: RowId,
    /// Narrows the statement to one tenant in addition to the connection scope.
    pub tenant: Option<TenantId>,
    pub expected: Version,
    pub fields: &'a Fields,
}

/// Row locks requested inside a transaction. `ids` is sorted and deduplicated.
#[derive(Debug, Clone, Copy)]
pub struct LockRequest<'a> {
    pub table: &'a str,
    pub tenant: TenantId,
    pub ids: &'a [RowId],
}

/// Opens physical connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: StorageConn;

    /// # Errors
    /// Returns an error if the storage engine is unreachable.
    async fn connect(&self) -> Result<Self::Conn>;
}

/// One physical link to the storage engine.
///
/// Only the pool and the scope manager call these methods; units of work reach
/// the connection through [`StorageConn::session`] and the protocol helpers.
#[async_trait]
pub trait StorageConn: Send + 'static {
    /// Engine-native handle exposed to units of work. It may be the raw
    /// connection, so callers are trusted not to touch scope or transaction
    /// state through it.
    type Session: Send;

    fn session(&mut self) -> &mut Self::Session;

    /// Sets the scoping attribute. `Neutral` clears it.
    ///
    /// # Errors
    /// Returns an error if the engine rejects the statement.
    async fn apply_scope(&mut self, scope: ScopeState) -> Result<()>;

    /// # Errors
    /// Returns an error if a transaction is already open or the engine fails.
    async fn begin(&mut self, cfg: &TxConfig) -> Result<()>;

    /// # Errors
    /// Returns `DbError::TransactionConflict` on serialization failures.
    async fn commit(&mut self) -> Result<()>;

    /// # Errors
    /// Returns an error if the engine fails to roll back.
    async fn rollback(&mut self) -> Result<()>;

    /// Single-statement conditional update that bumps `version` by one.
    /// `Ok(None)` means zero rows matched.
    ///
    /// # Errors
    /// Returns an error if the statement fails.
    async fn update_if_version(
        &mut self,
        write: &VersionedWrite<'_>,
    ) -> Result<Option<VersionedRecord>>;

    /// Reads one row as visible under the current scope.
    ///
    /// # Errors
    /// Returns an error if the statement fails.
    async fn read_record(
        &mut self,
        table: &str,
        id: RowId,
        tenant: Option<TenantId>,
    ) -> Result<Option<VersionedRecord>>;

    /// Locks the existing rows among `req.ids` until the transaction ends and
    /// returns the ids that were locked.
    ///
    /// # Errors
    /// Returns `DbError::TransactionConflict` if the lock wait times out.
    async fn lock_rows(&mut self, req: &LockRequest<'_>) -> Result<Vec<RowId>>;

    /// Liveness probe used by `test_before_acquire`.
    ///
    /// # Errors
    /// Returns an error if the connection is broken.
    async fn ping(&mut self) -> Result<()>;
}
