//! Pessimistic concurrency: explicit row locks held for the rest of a
//! transaction.
//!
//! Used for batch mutations whose rows must change together, such as
//! re-sequencing an ordered list. The lock set is always the minimal one: the
//! named primary keys of one tenant in one table. Keys are sorted before
//! locking so concurrent lockers of overlapping sets acquire them in the same
//! order.
//!
//! ```
//! use tenant_db::{LockTarget, RowId};
//!
//! let target = LockTarget::new("menu_items", [RowId(5), RowId(3), RowId(5)]);
//! assert_eq!(target.ids(), &[RowId(3), RowId(5)]);
//! ```

use tracing::debug;

use crate::engine::{Connector, LockRequest, RowId, StorageConn, validate_identifier};
use crate::error::{DbError, Result};
use crate::scope::ScopeState;
use crate::tenant::TenantId;
use crate::tx::DbTx;

/// Rows to lock: one table, explicit primary keys, one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTarget {
    table: String,
    ids: Vec<RowId>,
    tenant: Option<TenantId>,
}

impl LockTarget {
    /// Keys are deduplicated and sorted. The tenant defaults to the
    /// transaction's tenant scope.
    pub fn new(table: impl Into<String>, ids: impl IntoIterator<Item = RowId>) -> Self {
        let mut ids: Vec<RowId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self {
            table: table.into(),
            ids,
            tenant: None,
        }
    }

    /// Names the owning tenant. Required under a bypass scope; under a tenant
    /// scope it must match that tenant.
    #[must_use]
    pub fn for_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn ids(&self) -> &[RowId] {
        &self.ids
    }

    fn resolve_tenant(&self, scope: ScopeState) -> Result<TenantId> {
        match (scope, self.tenant) {
            (ScopeState::Tenant(t), None) => Ok(t),
            (ScopeState::Tenant(t), Some(requested)) if requested == t => Ok(t),
            (ScopeState::Tenant(t), Some(requested)) => Err(DbError::InvalidLockRequest(format!(
                "transaction is scoped to tenant {t} and cannot lock rows of tenant {requested}"
            ))),
            (ScopeState::Bypass, Some(requested)) => Ok(requested),
            (ScopeState::Bypass, None) => Err(DbError::InvalidLockRequest(
                "privileged transactions must name the tenant whose rows they lock".to_owned(),
            )),
            (ScopeState::Neutral, _) => Err(DbError::InvalidLockRequest(
                "connection has no scope".to_owned(),
            )),
        }
    }
}

/// Rows locked by [`DbTx::lock_rows`]; the locks last until the transaction
/// ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedRowSet {
    table: String,
    tenant: TenantId,
    locked: Vec<RowId>,
    missing: Vec<RowId>,
}

impl LockedRowSet {
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// Keys that exist and are now held, ascending.
    #[must_use]
    pub fn locked(&self) -> &[RowId] {
        &self.locked
    }

    /// Requested keys with no visible row for the tenant.
    #[must_use]
    pub fn missing(&self) -> &[RowId] {
        &self.missing
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl<C: Connector> DbTx<'_, C> {
    /// Locks the target rows until this transaction commits or rolls back.
    /// Blocks while another transaction holds any of them.
    ///
    /// # Errors
    /// - `InvalidLockRequest` for an empty key set, a bypass transaction
    ///   without an explicit tenant, or a tenant other than the scope's
    /// - `TransactionConflict` if the engine gives up waiting (lock timeout or
    ///   deadlock); the coordinator retries the whole transaction
    #[tracing::instrument(skip_all, fields(table = %target.table, rows = target.ids.len()))]
    pub async fn lock_rows(&mut self, target: &LockTarget) -> Result<LockedRowSet> {
        validate_identifier(&target.table)?;
        if target.ids.is_empty() {
            return Err(DbError::InvalidLockRequest(
                "at least one row id is required".to_owned(),
            ));
        }
        let tenant = target.resolve_tenant(self.scope())?;
        let req = LockRequest {
            table: &target.table,
            tenant,
            ids: &target.ids,
        };

        let mut locked = self.lease.conn_mut().lock_rows(&req).await?;
        locked.sort_unstable();
        locked.dedup();
        let missing: Vec<RowId> = target
            .ids
            .iter()
            .filter(|id| locked.binary_search(id).is_err())
            .copied()
            .collect();
        debug!(
            locked = locked.len(),
            missing = missing.len(),
            "row locks acquired"
        );
        Ok(LockedRowSet {
            table: target.table.clone(),
            tenant,
            locked,
            missing,
        })
    }
}
