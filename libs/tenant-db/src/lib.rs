#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant-isolated transactional data-access core.
//!
//! Every database operation runs on a pooled connection whose scoping
//! attribute restricts it to exactly one tenant, or to an explicit privileged
//! bypass. On top of that the crate provides transactions, optimistic version
//! checks and pessimistic row locks.
//!
//! # Layers
//! - [`Pool`]: bounded set of reusable connections with a wait budget
//! - [`TenantDb::run_scoped`] / [`TenantDb::run_privileged`]: borrow, scope,
//!   run, reset, release
//! - [`TenantDb::run_transaction`]: the same lifecycle wrapped in
//!   begin/commit/rollback, with bounded retry on transaction conflicts
//! - [`optimistic`]: version-guarded conditional writes
//! - [`pessimistic`]: explicit row locks inside a transaction
//!
//! # Features
//! - `pg`: PostgreSQL engine over `sqlx` (row-level security + session settings)
//! - `integration`: container-backed PostgreSQL tests
//!
//! # Example
//! ```
//! use tenant_db::{DbError, MemoryEngine, PoolCfg, TenantDb, TenantId};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), DbError> {
//! let db = TenantDb::new(tenant_db::Pool::new(MemoryEngine::new(), PoolCfg::sized(8))?);
//! let tenant = TenantId::new(7)?;
//!
//! let block = db
//!     .run_transaction(tenant, |mut tx| {
//!         Box::pin(async move {
//!             let fields = json!({"body": "Welcome"}).as_object().cloned().unwrap_or_default();
//!             let block = tx.session().insert("content_blocks", None, fields)?;
//!             Ok::<_, DbError>(block)
//!         })
//!     })
//!     .await?;
//!
//! // Editors echo back the version they loaded.
//! let edited = db
//!     .run_transaction(tenant, move |mut tx| {
//!         let (id, expected) = (block.id, block.version);
//!         Box::pin(async move {
//!             let fields = json!({"body": "Hello"}).as_object().cloned().unwrap_or_default();
//!             tx.update_versioned("content_blocks", id, expected, fields).await
//!         })
//!     })
//!     .await?;
//! assert_eq!(edited.version.get(), 2);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod optimistic;
pub mod pessimistic;
pub mod pool;
mod runner;
pub mod scope;
pub mod tenant;
pub mod tx;

pub use config::{PgScopeSettings, PoolCfg, RetryCfg, TenantDbConfig};
pub use context::{DbConn, TenantDb};
pub use engine::memory::{MemConnection, MemSession, MemoryEngine};
pub use engine::{Connector, Fields, RowId, StorageConn};
pub use error::{DbError, ErrorKind, Result, UnitOfWorkError};
pub use optimistic::{Version, Versioned, VersionedRecord, update_entity, update_versioned};
pub use pessimistic::{LockTarget, LockedRowSet};
pub use pool::{Pool, PoolStatus};
pub use runner::DbRunner;
pub use scope::{BypassGrant, ScopeState, TxScope};
pub use tenant::{StaticTenantResolver, TenantId, TenantResolver};
pub use tx::{DbTx, TxAccessMode, TxConfig, TxIsolationLevel, in_transaction};

#[cfg(feature = "pg")]
pub use engine::postgres::{PgConn, PgConnector, tenant_policy_ddl};

/// Future returned by a unit of work borrowing a connection for `'a`.
pub type UnitOfWorkFuture<'a, T, E> =
    Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'a>>;
