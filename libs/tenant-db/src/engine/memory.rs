//! In-process storage engine.
//!
//! Implements the full storage contract without an external database:
//!
//! - rows are filtered by the connection's scoping attribute (neutral sees
//!   nothing, a tenant sees its own rows, bypass sees everything);
//! - a transaction buffers its writes privately and applies them on commit;
//! - every written or explicitly locked row is held by the writing connection
//!   until its transaction ends, so conflicting writers and lockers block;
//! - a lock wait longer than the configured timeout fails with
//!   `DbError::TransactionConflict`, which also breaks lock cycles.
//!
//! Fault injection hooks (`fail_*`) let tests exercise the cleanup and retry
//! paths of the core.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::{
    Connector, Fields, LockRequest, RowId, StorageConn, VersionedWrite, strip_reserved,
    validate_identifier,
};
use crate::error::{DbError, Result};
use crate::optimistic::{Version, VersionedRecord};
use crate::scope::ScopeState;
use crate::tenant::TenantId;
use crate::tx::TxConfig;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type RowKey = (String, RowId);

/// Shared in-memory database. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryEngine {
    store: Arc<Store>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("open_connections", &self.open_connections())
            .field("lock_timeout", &self.store.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Engine whose row-lock waits give up after `lock_timeout`.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            store: Arc::new(Store {
                state: Mutex::new(StoreState::default()),
                released: Notify::new(),
                faults: Mutex::new(Faults::default()),
                next_conn: AtomicU64::new(1),
                live: AtomicUsize::new(0),
                lock_timeout,
            }),
        }
    }

    /// Number of physical connections currently alive.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.store.live.load(Ordering::SeqCst)
    }

    /// Number of row locks currently held by any connection.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.store.state.lock().locks.len()
    }

    /// Committed rows of `table`, unfiltered and ordered by id.
    #[must_use]
    pub fn committed_rows(&self, table: &str) -> Vec<VersionedRecord> {
        self.store
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes the next `n` scope resets (back to neutral) fail.
    pub fn fail_scope_resets(&self, n: usize) {
        self.store.faults.lock().scope_resets = n;
    }

    /// Makes the next `n` commits fail with a serialization conflict.
    pub fn fail_commits(&self, n: usize) {
        self.store.faults.lock().commits = n;
    }

    /// Makes the next `n` liveness probes fail.
    pub fn fail_pings(&self, n: usize) {
        self.store.faults.lock().pings = n;
    }
}

#[async_trait]
impl Connector for MemoryEngine {
    type Conn = MemConnection;

    async fn connect(&self) -> Result<MemConnection> {
        let id = self.store.next_conn.fetch_add(1, Ordering::SeqCst);
        self.store.live.fetch_add(1, Ordering::SeqCst);
        trace!(conn.id = id, "memory connection opened");
        Ok(MemConnection {
            session: MemSession {
                id,
                store: Arc::clone(&self.store),
                scope: ScopeState::Neutral,
                tx: None,
            },
        })
    }
}

struct Store {
    state: Mutex<StoreState>,
    released: Notify,
    faults: Mutex<Faults>,
    next_conn: AtomicU64,
    live: AtomicUsize,
    lock_timeout: Duration,
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Table>,
    /// Row key -> id of the owning connection.
    locks: HashMap<RowKey, u64>,
}

#[derive(Default)]
struct Table {
    rows: BTreeMap<RowId, VersionedRecord>,
    last_id: i64,
}

#[derive(Default)]
struct Faults {
    scope_resets: usize,
    commits: usize,
    pings: usize,
}

#[derive(Clone, Copy)]
enum Fault {
    ScopeReset,
    Commit,
    Ping,
}

impl Store {
    fn take_fault(&self, fault: Fault) -> bool {
        let mut faults = self.faults.lock();
        let remaining = match fault {
            Fault::ScopeReset => &mut faults.scope_resets,
            Fault::Commit => &mut faults.commits,
            Fault::Ping => &mut faults.pings,
        };
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Takes all of `keys` for `owner` or none of them, waiting for holders
    /// to release.
    async fn acquire(&self, owner: u64, keys: &[RowKey]) -> Result<()> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                let free = keys
                    .iter()
                    .all(|k| state.locks.get(k).is_none_or(|holder| *holder == owner));
                if free {
                    for key in keys {
                        state.locks.insert(key.clone(), owner);
                    }
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DbError::TransactionConflict(format!(
                    "lock wait exceeded {:?}",
                    self.lock_timeout
                )));
            }
        }
    }

    fn release<'k>(&self, owner: u64, keys: impl IntoIterator<Item = &'k RowKey>) {
        {
            let mut state = self.state.lock();
            for key in keys {
                if state.locks.get(key) == Some(&owner) {
                    state.locks.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }

    fn committed(&self, table: &str, id: RowId) -> Option<VersionedRecord> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id))
            .cloned()
    }

    fn apply(&self, writes: BTreeMap<RowKey, Option<VersionedRecord>>) {
        let mut state = self.state.lock();
        for ((table, id), write) in writes {
            let rows = &mut state.tables.entry(table).or_default().rows;
            match write {
                Some(record) => {
                    rows.insert(id, record);
                }
                None => {
                    rows.remove(&id);
                }
            }
        }
    }
}

/// Physical connection to a [`MemoryEngine`].
pub struct MemConnection {
    session: MemSession,
}

impl Drop for MemConnection {
    fn drop(&mut self) {
        self.session.abort();
        self.session.store.live.fetch_sub(1, Ordering::SeqCst);
        trace!(conn.id = self.session.id, "memory connection closed");
    }
}

struct TxState {
    writes: BTreeMap<RowKey, Option<VersionedRecord>>,
    held: HashSet<RowKey>,
    read_only: bool,
}

enum Change {
    Skip,
    Put(VersionedRecord),
    Delete,
}

/// Statement surface of a memory connection, handed to units of work.
///
/// Reads and writes are filtered by the scoping attribute the scope manager
/// set on the connection; the session cannot change it.
pub struct MemSession {
    id: u64,
    store: Arc<Store>,
    scope: ScopeState,
    tx: Option<TxState>,
}

impl MemSession {
    /// Identifier of the underlying physical connection.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn current_scope(&self) -> ScopeState {
        self.scope
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// All rows of `table` visible under the current scope, ordered by id.
    #[must_use]
    pub fn select(&self, table: &str) -> Vec<VersionedRecord> {
        let mut rows: BTreeMap<RowId, VersionedRecord> = self
            .store
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        if let Some(tx) = &self.tx {
            for ((t, id), write) in &tx.writes {
                if t != table {
                    continue;
                }
                match write {
                    Some(record) => {
                        rows.insert(*id, record.clone());
                    }
                    None => {
                        rows.remove(id);
                    }
                }
            }
        }
        rows.into_values().filter(|r| self.visible(r)).collect()
    }

    /// One row, if visible under the current scope.
    #[must_use]
    pub fn get(&self, table: &str, id: RowId) -> Option<VersionedRecord> {
        self.lookup(table, id).filter(|r| self.visible(r))
    }

    /// Inserts a row at version 1.
    ///
    /// Under a tenant scope the row belongs to that tenant; naming another
    /// tenant is rejected. Under bypass the owning tenant must be named.
    ///
    /// # Errors
    /// Returns `DbError::ScopeViolation` for tenant mismatches or a neutral
    /// connection, and `DbError::Storage` inside a read-only transaction.
    pub fn insert(
        &mut self,
        table: &str,
        tenant: Option<TenantId>,
        fields: Fields,
    ) -> Result<VersionedRecord> {
        validate_identifier(table)?;
        self.ensure_writable()?;
        let owner = match (self.scope, tenant) {
            (ScopeState::Tenant(t), None) => t,
            (ScopeState::Tenant(t), Some(requested)) if requested == t => t,
            (ScopeState::Tenant(t), Some(requested)) => {
                return Err(DbError::ScopeViolation(format!(
                    "tenant {t} cannot insert rows owned by tenant {requested}"
                )));
            }
            (ScopeState::Bypass, Some(requested)) => requested,
            (ScopeState::Bypass, None) => {
                return Err(DbError::ScopeViolation(
                    "privileged inserts must name the owning tenant".to_owned(),
                ));
            }
            (ScopeState::Neutral, _) => unreachable!("rejected by ensure_writable"),
        };

        let mut guard = self.store.state.lock();
        let state = &mut *guard;
        let t = state.tables.entry(table.to_owned()).or_default();
        t.last_id += 1;
        let record = VersionedRecord {
            id: RowId(t.last_id),
            tenant_id: owner,
            version: Version::INITIAL,
            fields: strip_reserved(fields),
        };
        let key = (table.to_owned(), record.id);
        match &mut self.tx {
            Some(tx) => {
                state.locks.insert(key.clone(), self.id);
                tx.held.insert(key.clone());
                tx.writes.insert(key, Some(record.clone()));
            }
            None => {
                t.rows.insert(record.id, record.clone());
            }
        }
        Ok(record)
    }

    /// Merges `changes` into a visible row and bumps its version.
    /// Returns `None` if no such row is visible.
    ///
    /// # Errors
    /// Returns `DbError::TransactionConflict` if the row stays locked past the
    /// lock timeout.
    pub async fn update(
        &mut self,
        table: &str,
        id: RowId,
        changes: Fields,
    ) -> Result<Option<VersionedRecord>> {
        let changes = strip_reserved(changes);
        self.mutate(table, id, None, |current| {
            current.updated(&changes).map(Change::Put)
        })
        .await
    }

    /// Deletes a visible row. Returns whether a row was deleted.
    ///
    /// # Errors
    /// Same as [`MemSession::update`].
    pub async fn delete(&mut self, table: &str, id: RowId) -> Result<bool> {
        Ok(self
            .mutate(table, id, None, |_| Ok(Change::Delete))
            .await?
            .is_some())
    }

    fn visible(&self, record: &VersionedRecord) -> bool {
        match self.scope {
            ScopeState::Neutral => false,
            ScopeState::Bypass => true,
            ScopeState::Tenant(t) => record.tenant_id == t,
        }
    }

    fn visible_to(&self, record: &VersionedRecord, tenant: Option<TenantId>) -> bool {
        self.visible(record) && tenant.is_none_or(|t| record.tenant_id == t)
    }

    fn lookup(&self, table: &str, id: RowId) -> Option<VersionedRecord> {
        if let Some(write) = self
            .tx
            .as_ref()
            .and_then(|tx| tx.writes.get(&(table.to_owned(), id)))
        {
            return write.clone();
        }
        self.store.committed(table, id)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.scope.is_neutral() {
            return Err(DbError::ScopeViolation(
                "connection has no tenant or bypass scope".to_owned(),
            ));
        }
        if self.tx.as_ref().is_some_and(|tx| tx.read_only) {
            return Err(DbError::Storage(
                "cannot write in a read-only transaction".to_owned(),
            ));
        }
        Ok(())
    }

    /// Locks the row, re-reads it and applies `change`. Returns the new image
    /// for `Put`, the old image for `Delete`, `None` otherwise.
    async fn mutate<F>(
        &mut self,
        table: &str,
        id: RowId,
        tenant: Option<TenantId>,
        change: F,
    ) -> Result<Option<VersionedRecord>>
    where
        F: FnOnce(&VersionedRecord) -> Result<Change> + Send,
    {
        validate_identifier(table)?;
        self.ensure_writable()?;
        if !self
            .lookup(table, id)
            .is_some_and(|r| self.visible_to(&r, tenant))
        {
            return Ok(None);
        }

        let key = (table.to_owned(), id);
        let store = Arc::clone(&self.store);
        store.acquire(self.id, std::slice::from_ref(&key)).await?;
        if let Some(tx) = &mut self.tx {
            tx.held.insert(key.clone());
        }

        let current = self
            .lookup(table, id)
            .filter(|r| self.visible_to(r, tenant));
        let outcome = match current.as_ref().map(change).transpose() {
            Ok(outcome) => outcome,
            Err(e) => {
                if self.tx.is_none() {
                    self.store.release(self.id, [&key]);
                }
                return Err(e);
            }
        };
        let (staged, result) = match outcome {
            None | Some(Change::Skip) => (None, None),
            Some(Change::Put(next)) => (Some(Some(next.clone())), Some(next)),
            Some(Change::Delete) => (Some(None), current),
        };

        match &mut self.tx {
            Some(tx) => {
                if let Some(write) = staged {
                    tx.writes.insert(key, write);
                }
            }
            None => {
                if let Some(write) = staged {
                    self.store.apply(BTreeMap::from([(key.clone(), write)]));
                }
                self.store.release(self.id, [&key]);
            }
        }
        Ok(result)
    }

    /// Ends any open transaction without applying it.
    fn abort(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.store.release(self.id, &tx.held);
        }
    }
}

#[async_trait]
impl StorageConn for MemConnection {
    type Session = MemSession;

    fn session(&mut self) -> &mut MemSession {
        &mut self.session
    }

    async fn apply_scope(&mut self, scope: ScopeState) -> Result<()> {
        if scope.is_neutral() && self.session.store.take_fault(Fault::ScopeReset) {
            return Err(DbError::Storage("scope reset rejected".to_owned()));
        }
        self.session.scope = scope;
        Ok(())
    }

    async fn begin(&mut self, cfg: &TxConfig) -> Result<()> {
        if self.session.tx.is_some() {
            return Err(DbError::Storage(
                "a transaction is already open on this connection".to_owned(),
            ));
        }
        self.session.tx = Some(TxState {
            writes: BTreeMap::new(),
            held: HashSet::new(),
            read_only: cfg.is_read_only(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let session = &mut self.session;
        let Some(tx) = session.tx.take() else {
            return Err(DbError::Storage("no transaction is open".to_owned()));
        };
        if session.store.take_fault(Fault::Commit) {
            session.store.release(session.id, &tx.held);
            return Err(DbError::TransactionConflict(
                "could not serialize access due to concurrent update".to_owned(),
            ));
        }
        session.store.apply(tx.writes);
        session.store.release(session.id, &tx.held);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.session.abort();
        Ok(())
    }

    async fn update_if_version(
        &mut self,
        write: &VersionedWrite<'_>,
    ) -> Result<Option<VersionedRecord>> {
        let expected = write.expected;
        let fields = write.fields;
        self.session
            .mutate(write.table, write.id, write.tenant, |current| {
                if current.version == expected {
                    current.updated(fields).map(Change::Put)
                } else {
                    Ok(Change::Skip)
                }
            })
            .await
    }

    async fn read_record(
        &mut self,
        table: &str,
        id: RowId,
        tenant: Option<TenantId>,
    ) -> Result<Option<VersionedRecord>> {
        validate_identifier(table)?;
        Ok(self
            .session
            .lookup(table, id)
            .filter(|r| self.session.visible_to(r, tenant)))
    }

    async fn lock_rows(&mut self, req: &LockRequest<'_>) -> Result<Vec<RowId>> {
        validate_identifier(req.table)?;
        let session = &mut self.session;
        if session.tx.is_none() {
            return Err(DbError::InvalidLockRequest(
                "row locks require an open transaction".to_owned(),
            ));
        }
        let existing = |s: &MemSession| -> Vec<RowId> {
            req.ids
                .iter()
                .copied()
                .filter(|id| {
                    s.lookup(req.table, *id)
                        .is_some_and(|r| s.visible_to(&r, Some(req.tenant)))
                })
                .collect()
        };

        let keys: Vec<RowKey> = existing(session)
            .into_iter()
            .map(|id| (req.table.to_owned(), id))
            .collect();
        let store = Arc::clone(&session.store);
        store.acquire(session.id, &keys).await?;
        if let Some(tx) = &mut session.tx {
            tx.held.extend(keys);
        }
        // Rows deleted while we waited are reported as missing.
        Ok(existing(session))
    }

    async fn ping(&mut self) -> Result<()> {
        if self.session.store.take_fault(Fault::Ping) {
            return Err(DbError::Storage("connection reset by peer".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> Fields {
        match v {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn tenant(raw: i64) -> TenantId {
        TenantId::new(raw).unwrap()
    }

    async fn scoped(engine: &MemoryEngine, scope: ScopeState) -> MemConnection {
        let mut conn = engine.connect().await.unwrap();
        conn.apply_scope(scope).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn rows_are_filtered_by_scope() {
        let engine = MemoryEngine::new();
        let mut admin = scoped(&engine, ScopeState::Bypass).await;
        for (t, name) in [(7, "bolt"), (7, "nut"), (8, "gear")] {
            admin
                .session()
                .insert("items", Some(tenant(t)), fields(json!({"name": name})))
                .unwrap();
        }

        let seven = scoped(&engine, ScopeState::Tenant(tenant(7))).await;
        assert_eq!(seven.session.select("items").len(), 2);
        assert!(seven.session.get("items", RowId(3)).is_none());

        let neutral = engine.connect().await.unwrap();
        assert!(neutral.session.select("items").is_empty());
        assert_eq!(admin.session().select("items").len(), 3);
    }

    #[tokio::test]
    async fn tenant_cannot_insert_for_another_tenant() {
        let engine = MemoryEngine::new();
        let mut conn = scoped(&engine, ScopeState::Tenant(tenant(7))).await;
        let err = conn
            .session()
            .insert("items", Some(tenant(8)), Fields::new())
            .unwrap_err();
        assert!(matches!(err, DbError::ScopeViolation(_)));

        let mut neutral = engine.connect().await.unwrap();
        assert!(matches!(
            neutral.session().insert("items", None, Fields::new()),
            Err(DbError::ScopeViolation(_))
        ));
    }

    #[tokio::test]
    async fn uncommitted_writes_stay_private() {
        let engine = MemoryEngine::new();
        let mut writer = scoped(&engine, ScopeState::Tenant(tenant(1))).await;
        writer.begin(&TxConfig::default()).await.unwrap();
        writer
            .session()
            .insert("items", None, fields(json!({"name": "draft"})))
            .unwrap();
        assert_eq!(writer.session().select("items").len(), 1);

        let reader = scoped(&engine, ScopeState::Tenant(tenant(1))).await;
        assert!(reader.session.select("items").is_empty());

        writer.rollback().await.unwrap();
        assert!(engine.committed_rows("items").is_empty());
        assert_eq!(engine.held_locks(), 0);
    }

    #[tokio::test]
    async fn conditional_write_checks_version() {
        let engine = MemoryEngine::new();
        let mut conn = scoped(&engine, ScopeState::Tenant(tenant(2))).await;
        let rec = conn
            .session()
            .insert("pages", None, fields(json!({"title": "a"})))
            .unwrap();
        let change = fields(json!({"title": "b"}));

        let stale = VersionedWrite {
            table: "pages",
            id: rec.id,
            tenant: Some(tenant(2)),
            expected: Version::new(4).unwrap(),
            fields: &change,
        };
        assert!(conn.update_if_version(&stale).await.unwrap().is_none());

        let fresh = VersionedWrite {
            expected: Version::INITIAL,
            ..stale
        };
        let updated = conn.update_if_version(&fresh).await.unwrap().unwrap();
        assert_eq!(updated.version.get(), 2);
        assert_eq!(engine.committed_rows("pages")[0].version.get(), 2);
    }

    #[tokio::test]
    async fn exhausted_version_fails_the_write_and_frees_the_row() {
        let engine = MemoryEngine::new();
        let mut conn = scoped(&engine, ScopeState::Tenant(tenant(2))).await;
        let mut rec = conn
            .session()
            .insert("pages", None, fields(json!({"title": "a"})))
            .unwrap();
        rec.version = Version::new(i64::MAX).unwrap();
        engine
            .store
            .apply(BTreeMap::from([(("pages".to_owned(), rec.id), Some(rec.clone()))]));

        let change = fields(json!({"title": "b"}));
        let write = VersionedWrite {
            table: "pages",
            id: rec.id,
            tenant: Some(tenant(2)),
            expected: rec.version,
            fields: &change,
        };
        let err = conn.update_if_version(&write).await.unwrap_err();
        assert!(matches!(err, DbError::Storage(_)));
        assert_eq!(engine.held_locks(), 0);
        assert_eq!(engine.committed_rows("pages")[0], rec);
    }

    #[tokio::test]
    async fn lock_wait_times_out_as_conflict() {
        let engine = MemoryEngine::with_lock_timeout(Duration::from_millis(50));
        let mut a = scoped(&engine, ScopeState::Tenant(tenant(1))).await;
        let id = a.session().insert("items", None, Fields::new()).unwrap().id;
        let mut b = scoped(&engine, ScopeState::Tenant(tenant(1))).await;
        let ids = [id];
        let req = LockRequest {
            table: "items",
            tenant: tenant(1),
            ids: &ids,
        };

        a.begin(&TxConfig::default()).await.unwrap();
        assert_eq!(a.lock_rows(&req).await.unwrap(), vec![id]);

        b.begin(&TxConfig::default()).await.unwrap();
        let err = b.lock_rows(&req).await.unwrap_err();
        assert!(err.is_transaction_conflict());

        a.commit().await.unwrap();
        assert_eq!(b.lock_rows(&req).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn dropping_a_connection_releases_its_locks() {
        let engine = MemoryEngine::new();
        let mut conn = scoped(&engine, ScopeState::Bypass).await;
        let id = conn
            .session()
            .insert("items", Some(tenant(3)), Fields::new())
            .unwrap()
            .id;
        conn.begin(&TxConfig::default()).await.unwrap();
        conn.session()
            .update("items", id, fields(json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(engine.held_locks(), 1);
        assert_eq!(engine.open_connections(), 1);

        drop(conn);
        assert_eq!(engine.held_locks(), 0);
        assert_eq!(engine.open_connections(), 0);
        assert!(!engine.committed_rows("items")[0].fields.contains_key("n"));
    }

    #[tokio::test]
    async fn read_only_transactions_reject_writes() {
        let engine = MemoryEngine::new();
        let mut conn = scoped(&engine, ScopeState::Tenant(tenant(1))).await;
        conn.begin(&TxConfig::read_only()).await.unwrap();
        assert!(matches!(
            conn.session().insert("items", None, Fields::new()),
            Err(DbError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn injected_faults_fire_once_each() {
        let engine = MemoryEngine::new();
        let mut conn = engine.connect().await.unwrap();
        engine.fail_scope_resets(1);
        engine.fail_pings(1);
        assert!(conn.apply_scope(ScopeState::Bypass).await.is_ok());
        assert!(conn.apply_scope(ScopeState::Neutral).await.is_err());
        assert!(conn.apply_scope(ScopeState::Neutral).await.is_ok());
        assert!(conn.ping().await.is_err());
        assert!(conn.ping().await.is_ok());
    }
}
