//! Bounded connection pool.
//!
//! A semaphore caps the number of connections in use; idle connections wait in
//! a LIFO queue. Every connection that leaves the idle queue is neutral, and
//! every connection that goes back into it has been made neutral again:
//!
//! 1. roll back if a transaction is still open;
//! 2. reset the scoping attribute to neutral;
//! 3. only then push it to the idle queue and release the permit.
//!
//! If step 1 or 2 fails the connection is destroyed instead. A [`PooledConn`]
//! dropped without [`PooledConn::release`] (cancelled future, panic) runs the
//! same steps on a spawned task and keeps its permit until they finish.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::PoolCfg;
use crate::engine::{Connector, StorageConn};
use crate::error::{DbError, Result};
use crate::scope::ScopeState;
use crate::tx::TxConfig;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_conns: usize,
    /// Connections currently borrowed or being cleaned up.
    pub in_use: usize,
    pub idle: usize,
    /// Physical connections opened over the pool's lifetime.
    pub opened: u64,
    /// Physical connections closed over the pool's lifetime.
    pub destroyed: u64,
}

/// Bounded pool of storage connections. Cloning shares the pool.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    cfg: PoolCfg,
    max_conns: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn<C::Conn>>>,
    opened: AtomicU64,
    destroyed: AtomicU64,
}

struct IdleConn<T> {
    conn: T,
    created: Instant,
    idle_since: Instant,
}

impl<C: Connector> Pool<C> {
    /// # Errors
    /// Returns `DbError::InvalidConfig` if `max_conns` is zero or the acquire
    /// timeout is zero.
    pub fn new(connector: C, cfg: PoolCfg) -> Result<Self> {
        let max_conns = usize::try_from(cfg.max_conns)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| DbError::InvalidConfig("pool.max_conns must be at least 1".into()))?;
        if cfg.acquire_timeout.is_zero() {
            return Err(DbError::InvalidConfig(
                "pool.acquire_timeout must be greater than zero".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                cfg,
                max_conns,
                permits: Arc::new(Semaphore::new(max_conns)),
                idle: Mutex::new(VecDeque::new()),
                opened: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
            }),
        })
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            max_conns: inner.max_conns,
            in_use: inner
                .max_conns
                .saturating_sub(inner.permits.available_permits()),
            idle: inner.idle.lock().len(),
            opened: inner.opened.load(Ordering::Relaxed),
            destroyed: inner.destroyed.load(Ordering::Relaxed),
        }
    }

    /// Stops handing out connections and closes idle ones. Borrowed
    /// connections are closed when they come back.
    pub fn close(&self) {
        self.inner.permits.close();
        let drained: Vec<_> = self.inner.idle.lock().drain(..).collect();
        for idle in drained {
            self.inner.discard(idle.conn, "pool closed");
        }
    }

    /// Borrows a neutral connection, waiting at most `acquire_timeout`.
    ///
    /// The budget covers the permit wait, opening a new connection and the
    /// liveness check of an idle one.
    pub(crate) async fn acquire(&self) -> Result<PooledConn<C>> {
        let wait = self.inner.cfg.acquire_timeout;
        let deadline = Instant::now() + wait;
        let borrow = async {
            let permit = Arc::clone(&self.inner.permits)
                .acquire_owned()
                .await
                .map_err(|_| DbError::PoolClosed)?;
            let (conn, created) = self.checkout().await?;
            Ok::<_, DbError>((permit, conn, created))
        };
        let (permit, conn, created) = match tokio::time::timeout_at(deadline, borrow).await {
            Ok(borrowed) => borrowed?,
            Err(_) => return Err(DbError::PoolExhausted { waited: wait }),
        };
        Ok(PooledConn {
            conn: Some(conn),
            created,
            scope: ScopeState::Neutral,
            in_tx: false,
            permit: Some(permit),
            pool: self.clone(),
        })
    }

    async fn checkout(&self) -> Result<(C::Conn, Instant)> {
        loop {
            let candidate = self.inner.idle.lock().pop_back();
            let Some(idle) = candidate else {
                break;
            };
            if self.inner.expired(&idle) {
                self.inner.discard(idle.conn, "expired");
                continue;
            }
            let mut conn = idle.conn;
            if self.inner.cfg.test_before_acquire
                && let Err(e) = conn.ping().await
            {
                warn!(error = %e, "idle connection failed liveness check");
                self.inner.discard(conn, "liveness check failed");
                continue;
            }
            return Ok((conn, idle.created));
        }

        let conn = self.inner.connector.connect().await?;
        let opened = self.inner.opened.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(opened, "opened storage connection");
        Ok((conn, Instant::now()))
    }
}

impl<C: Connector> PoolInner<C> {
    fn expired(&self, idle: &IdleConn<C::Conn>) -> bool {
        let now = Instant::now();
        self.cfg
            .idle_timeout
            .is_some_and(|t| now.duration_since(idle.idle_since) >= t)
            || self
                .cfg
                .max_lifetime
                .is_some_and(|t| now.duration_since(idle.created) >= t)
    }

    fn discard(&self, conn: C::Conn, reason: &'static str) {
        drop(conn);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(reason, "destroyed storage connection");
    }
}

/// Exclusive borrow of one pooled connection.
///
/// Tracks the scope and transaction state it has put on the connection so
/// that cleanup knows what to undo.
pub(crate) struct PooledConn<C: Connector> {
    conn: Option<C::Conn>,
    created: Instant,
    scope: ScopeState,
    in_tx: bool,
    permit: Option<OwnedSemaphorePermit>,
    pool: Pool<C>,
}

impl<C: Connector> PooledConn<C> {
    pub(crate) fn conn_mut(&mut self) -> &mut C::Conn {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }

    pub(crate) fn scope(&self) -> ScopeState {
        self.scope
    }

    /// Applies `scope` to the connection. The scope is recorded first so a
    /// failed or cancelled statement is still undone on release.
    pub(crate) async fn set_scope(&mut self, scope: ScopeState) -> Result<()> {
        self.scope = scope;
        self.conn_mut().apply_scope(scope).await
    }

    pub(crate) async fn begin(&mut self, cfg: &TxConfig) -> Result<()> {
        self.in_tx = true;
        self.conn_mut().begin(cfg).await
    }

    pub(crate) async fn commit(&mut self) -> Result<()> {
        self.conn_mut().commit().await?;
        self.in_tx = false;
        Ok(())
    }

    pub(crate) async fn rollback(&mut self) -> Result<()> {
        self.conn_mut().rollback().await?;
        self.in_tx = false;
        Ok(())
    }

    /// Cleans the connection and returns it to the pool. Cleanup failures are
    /// logged and the connection is destroyed; they are not reported to the
    /// caller. Dropping this future part-way closes the connection.
    pub(crate) async fn release(mut self) {
        if let Some(checkin) = self.take_checkin() {
            checkin.recycle().await;
        }
    }

    fn take_checkin(&mut self) -> Option<Checkin<C>> {
        let conn = self.conn.take()?;
        Some(Checkin {
            conn: Some(conn),
            created: self.created,
            scope: self.scope,
            in_tx: self.in_tx,
            permit: self.permit.take(),
            pool: self.pool.clone(),
        })
    }
}

impl<C: Connector> Drop for PooledConn<C> {
    fn drop(&mut self) {
        let Some(checkin) = self.take_checkin() else {
            return;
        };
        if checkin.is_clean() {
            checkin.put_idle();
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!(scope = %checkin.scope, in_tx = checkin.in_tx, "cleaning up abandoned connection");
            handle.spawn(checkin.recycle());
        } else {
            warn!(scope = %checkin.scope, "no runtime to clean up abandoned connection");
            checkin.destroy("abandoned outside a runtime");
        }
    }
}

/// A connection on its way back to the pool, together with its permit.
///
/// Dropped before it reaches the idle queue (a cancelled [`PooledConn::release`]),
/// it closes the connection.
struct Checkin<C: Connector> {
    conn: Option<C::Conn>,
    created: Instant,
    scope: ScopeState,
    in_tx: bool,
    permit: Option<OwnedSemaphorePermit>,
    pool: Pool<C>,
}

impl<C: Connector> Checkin<C> {
    fn is_clean(&self) -> bool {
        self.scope.is_neutral() && !self.in_tx
    }

    fn conn_mut(&mut self) -> &mut C::Conn {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection already checked in"),
        }
    }

    async fn recycle(mut self) {
        if self.in_tx {
            if let Err(e) = self.conn_mut().rollback().await {
                error!(error = %e, "rollback during connection cleanup failed");
                self.destroy("rollback failed");
                return;
            }
            self.in_tx = false;
        }
        if !self.scope.is_neutral() {
            if let Err(e) = self.conn_mut().apply_scope(ScopeState::Neutral).await {
                let err = DbError::CleanupFailure(e.to_string());
                error!(error = %err, scope = %self.scope, "destroying connection with unreset scope");
                self.destroy("scope reset failed");
                return;
            }
            self.scope = ScopeState::Neutral;
        }
        self.put_idle();
    }

    fn put_idle(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let inner = &self.pool.inner;
        if inner.permits.is_closed() {
            inner.discard(conn, "pool closed");
        } else {
            inner.idle.lock().push_back(IdleConn {
                conn,
                created: self.created,
                idle_since: Instant::now(),
            });
        }
        drop(self.permit.take());
    }

    fn destroy(mut self, reason: &'static str) {
        if let Some(conn) = self.conn.take() {
            self.pool.inner.discard(conn, reason);
        }
        drop(self.permit.take());
    }
}

impl<C: Connector> Drop for Checkin<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(scope = %self.scope, in_tx = self.in_tx, "connection cleanup interrupted");
            self.pool.inner.discard(conn, "cleanup interrupted");
        }
    }
}
