//! PostgreSQL storage engine.
//!
//! Scoping uses two custom session settings (by default `app.tenant_id` and
//! `app.bypass_rls`) read by row-level-security policies; see
//! [`tenant_policy_ddl`]. The application role must not own the tables or be
//! a superuser, otherwise the policies do not apply to it.
//!
//! Inside a transaction the scope is set with `is_local = true`, so it also
//! disappears at commit or rollback.
//!
//! Units of work get the [`PgConnection`] itself. Nothing stops them from
//! calling `set_config` on the scope settings or ending the transaction, and
//! doing so breaks the isolation the pool maintains.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::types::Json;
use sqlx::{ConnectOptions, Connection, Executor};
use tracing::debug;

use super::{Connector, LockRequest, RowId, StorageConn, VersionedWrite, validate_identifier};
use crate::config::PgScopeSettings;
use crate::error::{DbError, Result};
use crate::optimistic::VersionedRecord;
use crate::scope::ScopeState;
use crate::tenant::TenantId;
use crate::tx::TxConfig;

/// Opens [`PgConn`]s from typed connect options.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    settings: PgScopeSettings,
    lock_timeout: Option<Duration>,
}

impl PgConnector {
    /// # Errors
    /// Returns `DbError::InvalidConfig` for malformed setting names.
    pub fn new(options: PgConnectOptions, settings: PgScopeSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            options,
            settings,
            lock_timeout: None,
        })
    }

    /// # Errors
    /// Returns `DbError::InvalidConfig` if the DSN does not parse.
    pub fn from_dsn(dsn: &str, settings: PgScopeSettings) -> Result<Self> {
        let options = dsn
            .parse::<PgConnectOptions>()
            .map_err(|e| DbError::InvalidConfig(format!("invalid postgres DSN: {e}")))?;
        debug!(dsn = %redact_dsn(dsn), "configured postgres connector");
        Self::new(options, settings)
    }

    /// Row-lock waits longer than this fail with SQLSTATE `55P03`, which the
    /// coordinator treats as a transaction conflict.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

/// `in_failed_sql_transaction`: statement issued after an error in the same transaction.
const IN_FAILED_SQL_TRANSACTION: &str = "25P02";

const COMMIT_CHECKED: &str = "SELECT 1; COMMIT";

fn is_failed_transaction(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == IN_FAILED_SQL_TRANSACTION)
}

fn redact_dsn(dsn: &str) -> String {
    match url::Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_owned(),
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgConn;

    async fn connect(&self) -> Result<PgConn> {
        let mut conn = self.options.connect().await?;
        if let Some(timeout) = self.lock_timeout {
            sqlx::query("SELECT set_config('lock_timeout', $1, false)")
                .bind(format!("{}ms", timeout.as_millis()))
                .execute(&mut conn)
                .await?;
        }
        Ok(PgConn {
            conn,
            settings: self.settings.clone(),
            in_tx: false,
        })
    }
}

/// One PostgreSQL connection.
pub struct PgConn {
    conn: PgConnection,
    settings: PgScopeSettings,
    in_tx: bool,
}

#[async_trait]
impl StorageConn for PgConn {
    type Session = PgConnection;

    fn session(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    async fn apply_scope(&mut self, scope: ScopeState) -> Result<()> {
        let (tenant, bypass) = match scope {
            ScopeState::Neutral => (String::new(), "off"),
            ScopeState::Tenant(id) => (id.to_string(), "off"),
            ScopeState::Bypass => (String::new(), "on"),
        };
        let is_local = self.in_tx && !scope.is_neutral();
        sqlx::query("SELECT set_config($1, $2, $5), set_config($3, $4, $5)")
            .bind(&self.settings.tenant_setting)
            .bind(tenant)
            .bind(&self.settings.bypass_setting)
            .bind(bypass)
            .bind(is_local)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn begin(&mut self, cfg: &TxConfig) -> Result<()> {
        let stmt = cfg.begin_statement();
        (&mut self.conn).execute(sqlx::raw_sql(&stmt)).await?;
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        // COMMIT ends the transaction whether or not it succeeds.
        self.in_tx = false;
        // On an aborted transaction COMMIT answers with a ROLLBACK tag and no
        // error. The leading statement fails with 25P02 instead and the
        // COMMIT after it is not run.
        match (&mut self.conn).execute(sqlx::raw_sql(COMMIT_CHECKED)).await {
            Ok(_) => Ok(()),
            Err(e) if is_failed_transaction(&e) => {
                (&mut self.conn).execute(sqlx::raw_sql("ROLLBACK")).await?;
                Err(DbError::Storage(
                    "transaction was aborted by an earlier failed statement and rolled back"
                        .to_owned(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        (&mut self.conn).execute(sqlx::raw_sql("ROLLBACK")).await?;
        self.in_tx = false;
        Ok(())
    }

    async fn update_if_version(
        &mut self,
        write: &VersionedWrite<'_>,
    ) -> Result<Option<VersionedRecord>> {
        let sql = conditional_update_sql(write.table, write.fields.keys().map(String::as_str))?;
        let row: Option<Value> = sqlx::query_scalar(&sql)
            .bind(Json(write.fields))
            .bind(write.id.0)
            .bind(write.expected.get())
            .bind(write.tenant.map(TenantId::get))
            .fetch_optional(&mut self.conn)
            .await?;
        row.map(VersionedRecord::from_row_json).transpose()
    }

    async fn read_record(
        &mut self,
        table: &str,
        id: RowId,
        tenant: Option<TenantId>,
    ) -> Result<Option<VersionedRecord>> {
        validate_identifier(table)?;
        let sql = format!(
            r#"SELECT to_jsonb(t.*) FROM "{table}" AS t
               WHERE t."id" = $1 AND ($2::bigint IS NULL OR t."tenant_id" = $2)"#
        );
        let row: Option<Value> = sqlx::query_scalar(&sql)
            .bind(id.0)
            .bind(tenant.map(TenantId::get))
            .fetch_optional(&mut self.conn)
            .await?;
        row.map(VersionedRecord::from_row_json).transpose()
    }

    async fn lock_rows(&mut self, req: &LockRequest<'_>) -> Result<Vec<RowId>> {
        validate_identifier(req.table)?;
        let sql = format!(
            r#"SELECT t."id" FROM "{}" AS t
               WHERE t."tenant_id" = $1 AND t."id" = ANY($2)
               ORDER BY t."id"
               FOR UPDATE"#,
            req.table
        );
        let ids: Vec<i64> = req.ids.iter().map(|id| id.0).collect();
        let locked: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(req.tenant.get())
            .bind(ids)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(locked.into_iter().map(RowId).collect())
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn.ping().await?;
        Ok(())
    }
}

/// `UPDATE ... WHERE id AND version` in one statement; the new values come
/// from a JSON object bound as `$1` and cast to the table's row type.
fn conditional_update_sql<'c>(
    table: &str,
    columns: impl Iterator<Item = &'c str>,
) -> Result<String> {
    validate_identifier(table)?;
    let mut assignments = Vec::new();
    for column in columns {
        validate_identifier(column)?;
        assignments.push(format!(r#""{column}" = p."{column}""#));
    }
    assignments.push(r#""version" = t."version" + 1"#.to_owned());
    Ok(format!(
        r#"UPDATE "{table}" AS t SET {}
           FROM jsonb_populate_record(NULL::"{table}", $1) AS p
           WHERE t."id" = $2 AND t."version" = $3
             AND ($4::bigint IS NULL OR t."tenant_id" = $4)
           RETURNING to_jsonb(t.*)"#,
        assignments.join(", ")
    ))
}

/// Statements that put `table` under tenant row-level security.
///
/// Rows are visible when `tenant_id` equals the tenant setting, or when the
/// bypass setting is `on`. A neutral connection (both settings empty/off)
/// sees nothing.
///
/// # Errors
/// Returns `DbError::InvalidIdentifier` for an unsafe table name.
pub fn tenant_policy_ddl(table: &str, settings: &PgScopeSettings) -> Result<Vec<String>> {
    validate_identifier(table)?;
    let tenant = &settings.tenant_setting;
    let bypass = &settings.bypass_setting;
    let predicate = format!(
        "current_setting('{bypass}', true) = 'on' \
         OR \"tenant_id\" = NULLIF(current_setting('{tenant}', true), '')::bigint"
    );
    Ok(vec![
        format!(r#"ALTER TABLE "{table}" ENABLE ROW LEVEL SECURITY"#),
        format!(r#"ALTER TABLE "{table}" FORCE ROW LEVEL SECURITY"#),
        format!(r#"DROP POLICY IF EXISTS "{table}_tenant_isolation" ON "{table}""#),
        format!(
            r#"CREATE POLICY "{table}_tenant_isolation" ON "{table}" USING ({predicate}) WITH CHECK ({predicate})"#
        ),
    ])
}
