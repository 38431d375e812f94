//! Tenant context manager.
//!
//! [`TenantDb::run_scoped`] and [`TenantDb::run_privileged`] borrow a
//! connection, set its scoping attribute, run the unit of work, and put the
//! connection back neutral on every exit path. The unit of work receives a
//! [`DbConn`] and never sees the pool.
//!
//! ```
//! use tenant_db::{MemoryEngine, PoolCfg, TenantDb, TenantId};
//!
//! # async fn demo() -> Result<(), tenant_db::DbError> {
//! let db = TenantDb::new(tenant_db::Pool::new(MemoryEngine::new(), PoolCfg::sized(4))?);
//! let tenant = TenantId::new(7)?;
//!
//! let visible = db
//!     .run_scoped(tenant, |mut conn| {
//!         Box::pin(async move { Ok::<_, tenant_db::DbError>(conn.session().select("items").len()) })
//!     })
//!     .await?;
//! assert_eq!(visible, 0);
//! # Ok(())
//! # }
//! ```

use tracing::{debug, info};

use crate::UnitOfWorkFuture;
use crate::config::{RetryCfg, TenantDbConfig};
use crate::engine::{Connector, Fields, RowId, StorageConn};
use crate::error::{DbError, Result, UnitOfWorkError};
use crate::optimistic::{self, Version, VersionedRecord};
use crate::pool::{Pool, PooledConn};
use crate::scope::{BypassGrant, ScopeState};
use crate::tenant::TenantId;
use crate::tx::{TxConfig, in_transaction};

/// Entry point for all tenant-scoped data access.
///
/// Cheap to clone; clones share the pool.
pub struct TenantDb<C: Connector> {
    pool: Pool<C>,
    pub(crate) retry: RetryCfg,
    pub(crate) tx_defaults: TxConfig,
}

impl<C: Connector> Clone for TenantDb<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            retry: self.retry,
            tx_defaults: self.tx_defaults,
        }
    }
}

impl<C: Connector> std::fmt::Debug for TenantDb<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantDb")
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> TenantDb<C> {
    #[must_use]
    pub fn new(pool: Pool<C>) -> Self {
        Self {
            pool,
            retry: RetryCfg::default(),
            tx_defaults: TxConfig::default(),
        }
    }

    /// Builds the pool and coordinator from a validated configuration.
    ///
    /// # Errors
    /// Returns `DbError::InvalidConfig` if the configuration is out of range.
    pub fn from_config(connector: C, cfg: &TenantDbConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::new(Pool::new(connector, cfg.pool.clone())?)
            .with_retry(cfg.retry)
            .with_tx_defaults(cfg.tx_defaults()))
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryCfg) -> Self {
        self.retry = retry;
        self
    }

    /// Configuration used by [`TenantDb::run_transaction`].
    #[must_use]
    pub fn with_tx_defaults(mut self, cfg: TxConfig) -> Self {
        self.tx_defaults = cfg;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Runs `f` on a connection scoped to `tenant`.
    ///
    /// Statements run in autocommit mode; use [`TenantDb::run_transaction`]
    /// when several writes must be atomic.
    ///
    /// # Errors
    /// Returns `ConnRequestedInsideTx` when called inside a transaction,
    /// `PoolExhausted` when no connection frees up in time, or the unit of
    /// work's own error.
    #[tracing::instrument(skip_all, fields(tenant.id = %tenant))]
    pub async fn run_scoped<F, T, E>(&self, tenant: TenantId, f: F) -> std::result::Result<T, E>
    where
        F: for<'a> FnOnce(DbConn<'a, C>) -> UnitOfWorkFuture<'a, T, E> + Send,
        T: Send,
        E: UnitOfWorkError,
    {
        self.run_with_scope(ScopeState::Tenant(tenant), f).await
    }

    /// Runs `f` with tenant filtering lifted.
    ///
    /// Only system entrypoints can build a [`BypassGrant`], so tenant input
    /// can never select this path.
    ///
    /// # Errors
    /// Same as [`TenantDb::run_scoped`].
    #[tracing::instrument(skip_all, fields(reason = grant.reason()))]
    pub async fn run_privileged<F, T, E>(
        &self,
        grant: BypassGrant,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'a> FnOnce(DbConn<'a, C>) -> UnitOfWorkFuture<'a, T, E> + Send,
        T: Send,
        E: UnitOfWorkError,
    {
        info!(
            target: "security",
            reason = grant.reason(),
            "privileged bypass scope opened"
        );
        self.run_with_scope(ScopeState::Bypass, f).await
    }

    async fn run_with_scope<F, T, E>(&self, scope: ScopeState, f: F) -> std::result::Result<T, E>
    where
        F: for<'a> FnOnce(DbConn<'a, C>) -> UnitOfWorkFuture<'a, T, E> + Send,
        T: Send,
        E: UnitOfWorkError,
    {
        if in_transaction() {
            return Err(DbError::ConnRequestedInsideTx.into());
        }
        let mut lease = self.pool.acquire().await?;
        let result = match lease.set_scope(scope).await {
            Ok(()) => f(DbConn { lease: &mut lease }).await,
            Err(e) => Err(e.into()),
        };
        lease.release().await;
        debug!(%scope, ok = result.is_ok(), "scoped unit of work finished");
        result
    }
}

/// Connection handle given to a scoped unit of work.
///
/// Valid only for the duration of the unit of work; the scope it carries was
/// set by the context manager and cannot be changed through it.
pub struct DbConn<'a, C: Connector> {
    pub(crate) lease: &'a mut PooledConn<C>,
}

impl<C: Connector> DbConn<'_, C> {
    /// Engine-native statement surface, filtered by the connection's scope.
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::config::PoolCfg;
    use crate::engine::memory::MemoryEngine;

    fn db(engine: &MemoryEngine) -> TenantDb<MemoryEngine> {
        TenantDb::new(Pool::new(engine.clone(), PoolCfg::sized(1)).unwrap())
    }

    #[tokio::test]
    #[traced_test]
    async fn privileged_scope_is_audited() {
        let engine = MemoryEngine::new();
        let db = db(&engine);
        let scope = db
            .run_privileged(BypassGrant::system("platform report"), |conn| {
                Box::pin(async move { Ok::<_, DbError>(conn.scope()) })
            })
            .await
            .unwrap();
        assert!(scope.is_bypass());
        assert!(logs_contain("privileged bypass scope opened"));
        assert!(logs_contain("platform report"));
    }

    #[tokio::test]
    async fn unit_of_work_error_propagates_after_cleanup() {
        let engine = MemoryEngine::new();
        let db = db(&engine);
        let tenant = TenantId::new(3).unwrap();

        let err = db
            .run_scoped(tenant, |mut conn| {
                Box::pin(async move {
                    let Some(fields) = json!({"name": "x"}).as_object().cloned() else {
                        unreachable!()
                    };
                    conn.session().insert("items", None, fields)?;
                    Err::<(), _>(anyhow::anyhow!("validation failed after insert"))
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "validation failed after insert");

        let status = db.pool().status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.idle, 1);
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_replace_result() {
        let engine = MemoryEngine::new();
        let db = db(&engine);
        engine.fail_scope_resets(1);
        // The failed reset happens on release; the unit of work itself succeeds.
        let out = db
            .run_scoped(TenantId::new(1).unwrap(), |_conn| {
                Box::pin(async move { Ok::<_, DbError>(42) })
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(db.pool().status().destroyed, 1);
    }
}
