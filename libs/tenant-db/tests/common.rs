#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]
use std::time::Duration;

use serde_json::Value;
use tenant_db::{
    BypassGrant, DbError, Fields, MemoryEngine, Pool, PoolCfg, RetryCfg, TenantDb, TenantId,
    VersionedRecord,
};

pub const SEED: BypassGrant = BypassGrant::system("test fixture seeding");

#[must_use]
pub fn tenant(raw: i64) -> TenantId {
    TenantId::new(raw).unwrap()
}

/// Turns a `json!({...})` literal into a field map.
#[must_use]
pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Pool of `max_conns` memory connections with short waits and fast retries.
#[must_use]
pub fn memory_db(engine: &MemoryEngine, max_conns: u32) -> TenantDb<MemoryEngine> {
    let pool = Pool::new(
        engine.clone(),
        PoolCfg {
            acquire_timeout: Duration::from_secs(2),
            ..PoolCfg::sized(max_conns)
        },
    )
    .unwrap();
    TenantDb::new(pool).with_retry(RetryCfg {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    })
}

/// Inserts a row owned by `owner` through a privileged scope.
pub async fn seed(
    db: &TenantDb<MemoryEngine>,
    table: &'static str,
    owner: TenantId,
    value: Value,
) -> VersionedRecord {
    let row = fields(value);
    db.run_privileged(SEED, move |mut conn| {
        Box::pin(async move { conn.session().insert(table, Some(owner), row) })
    })
    .await
    .unwrap()
}

/// Rows of `table` visible to `owner`.
pub async fn visible_rows(
    db: &TenantDb<MemoryEngine>,
    table: &'static str,
    owner: TenantId,
) -> Vec<VersionedRecord> {
    db.run_scoped(owner, move |mut conn| {
        Box::pin(async move { Ok::<_, DbError>(conn.session().select(table)) })
    })
    .await
    .unwrap()
}
