//! Transaction coordinator.
//!
//! [`TenantDb::run_transaction`] wraps the scoped lifecycle of the context
//! manager with begin/commit/rollback on the one borrowed connection:
//!
//! ```text
//! acquire -> BEGIN -> set scope -> unit of work -> COMMIT | ROLLBACK -> reset scope -> release
//! ```
//!
//! A transaction conflict reported by the engine (from any step) discards the
//! attempt and re-runs the whole unit of work on a fresh transaction, up to
//! `RetryCfg::max_attempts` times. Nested transactions are rejected.

use std::cell::Cell;

use tracing::{debug, info, warn};

use crate::UnitOfWorkFuture;
use crate::context::TenantDb;
use crate::engine::{Connector, Fields, RowId, StorageConn};
use crate::error::{DbError, Result, UnitOfWorkError};
use crate::optimistic::{self, Version, VersionedRecord};
use crate::pool::PooledConn;
use crate::scope::{ScopeState, TxScope};

mod config;

pub use config::{TxAccessMode, TxConfig, TxIsolationLevel};

// Set to `true` while a unit of work runs inside a transaction. Scoped
// borrows and nested transactions check it and refuse to open a second
// connection that would silently escape the transaction.
tokio::task_local! {
    static IN_TX: Cell<bool>;
}

/// Whether the current task is running a transactional unit of work.
#[must_use]
pub fn in_transaction() -> bool {
    IN_TX.try_with(Cell::get).unwrap_or(false)
}

/// Transaction handle given to a unit of work.
///
/// Every statement issued through it runs on the transaction's connection.
pub struct DbTx<'a, C: Connector> {
    pub(crate) lease: &'a mut PooledConn<C>,
}

impl<C: Connector> DbTx<'_, C> {
    /// Engine-native statement surface, filtered by the transaction's scope.
    ///
    /// The handle is the raw engine connection. Units of work must not change
    /// the scoping settings or issue transaction-control statements on it
    /// (`set_config` on the scope settings, `BEGIN`, `COMMIT`, `ROLLBACK`);
    /// the pool and the coordinator own both and only undo what they set.
    pub fn session(&mut self) -> &mut <C::Conn as StorageConn>::Session {
        self.lease.conn_mut().session()
    }

    #[must_use]
    pub fn scope(&self) -> ScopeState {
        self.lease.scope()
    }

    /// # Errors
    /// See [`optimistic::fetch`].
    pub async fn fetch(&mut self, table: &str, id: RowId) -> Result<VersionedRecord> {
        optimistic::fetch(self, table, id).await
    }

    /// # Errors
    /// See [`optimistic::update_versioned`].
    pub async fn update_versioned(
        &mut self,
        table: &str,
        id: RowId,
        expected: Version,
        fields: Fields,
    ) -> Result<VersionedRecord> {
        optimistic::update_versioned(self, table, id, expected, fields).await
    }
}

impl<C: Connector> TenantDb<C> {
    /// Runs `f` inside a transaction under `scope` with the configured
    /// defaults.
    ///
    /// `f` may run more than once when the engine reports a transaction
    /// conflict, so it must not carry side effects outside the transaction.
    ///
    /// # Errors
    /// - `NestedTransaction` when called inside another transaction
    /// - `TransactionConflict` once retries are exhausted
    /// - begin/commit failures and the unit of work's own error
    pub async fn run_transaction<F, T, E>(
        &self,
        scope: impl Into<TxScope>,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'a> FnMut(DbTx<'a, C>) -> UnitOfWorkFuture<'a, T, E> + Send,
        T: Send,
        E: UnitOfWorkError,
    {
        self.execute(scope.into(), self.tx_defaults, f).await
    }

    /// Same as [`TenantDb::run_transaction`] with an explicit configuration.
    ///
    /// # Errors
    /// Same as [`TenantDb::run_transaction`].
    pub async fn run_transaction_with_config<F, T, E>(
        &self,
        scope: impl Into<TxScope>,
        cfg: TxConfig,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'a> FnMut(DbTx<'a, C>) -> UnitOfWorkFuture<'a, T, E> + Send,
        T: Send,
        E: UnitOfWorkError,
    {
        self.execute(scope.into(), cfg, f).await
    }

    #[tracing::instrument(skip_all, fields(scope = %scope))]
    async fn execute<F, T, E>(
        &self,
        scope: TxScope,
        cfg: TxConfig,
        mut f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'a> FnMut(DbTx<'a, C>) -> UnitOfWorkFuture<'a, T, E> + Send,
        T: Send,
        E: UnitOfWorkError,
    {
        if in_transaction() {
            return Err(DbError::NestedTransaction.into());
        }
        if let TxScope::Bypass(grant) = scope {
            info!(
                target: "security",
                reason = grant.reason(),
                "privileged bypass transaction opened"
            );
        }

        let mut attempt = 1;
        loop {
            let err = match self.attempt(scope.state(), &cfg, &mut f).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match err.as_db_error() {
                Some(db_err)
                    if db_err.is_transaction_conflict() && attempt < self.retry.max_attempts =>
                {
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, ?delay, error = %db_err, "transaction conflict, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return Err(err),
            }
        }
    }

    async fn attempt<F, T, E>(
        &self,
        scope: ScopeState,
        cfg: &TxConfig,
        f: &mut F,
    ) -> std::result::Result<T, E>
    where
        F: for<'a> FnMut(DbTx<'a, C>) -> UnitOfWorkFuture<'a, T, E> + Send,
        T: Send,
        E: UnitOfWorkError,
    {
        let mut lease = self.pool().acquire().await?;
        let result = run_on(&mut lease, scope, cfg, f).await;
        lease.release().await;
        result
    }
}

async fn run_on<C, F, T, E>(
    lease: &mut PooledConn<C>,
    scope: ScopeState,
    cfg: &TxConfig,
    f: &mut F,
) -> std::result::Result<T, E>
where
    C: Connector,
    F: for<'a> FnMut(DbTx<'a, C>) -> UnitOfWorkFuture<'a, T, E> + Send,
    T: Send,
    E: UnitOfWorkError,
{
    lease.begin(cfg).await?;
    lease.set_scope(scope).await?;

    let outcome = IN_TX.scope(Cell::new(true), f(DbTx { lease: &mut *lease })).await;
    match outcome {
        Ok(value) => {
            lease.commit().await?;
            debug!("transaction committed");
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = lease.rollback().await {
                warn!(error = %rollback_err, "rollback failed, connection will be discarded");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_is_scoped_to_the_unit_of_work() {
        assert!(!in_transaction());
        let inside = IN_TX.scope(Cell::new(true), async { in_transaction() }).await;
        assert!(inside);
        assert!(!in_transaction());
    }
}
