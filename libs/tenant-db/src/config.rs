//! Configuration for the tenant data-access core.
//!
//! ```yaml
//! tenant_db:
//!   pool:
//!     max_conns: 20
//!     acquire_timeout: 5s
//!     idle_timeout: 10m
//!   retry:
//!     max_attempts: 4
//!     initial_backoff: 20ms
//!   isolation: serializable
//!   postgres:
//!     tenant_setting: app.tenant_id
//! ```

use std::time::Duration;

use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::tx::{TxConfig, TxIsolationLevel};

/// Top-level configuration section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TenantDbConfig {
    pub pool: PoolCfg,
    pub retry: RetryCfg,
    /// Isolation level for transactions that don't ask for one.
    pub isolation: Option<TxIsolationLevel>,
    pub postgres: PgScopeSettings,
}

impl TenantDbConfig {
    /// Extracts the section at `key`, falling back to defaults when it is absent.
    ///
    /// # Errors
    /// Returns `DbError::Config` if the section is malformed and
    /// `DbError::InvalidConfig` if a value is out of range.
    pub fn from_figment(figment: &Figment, key: &str) -> Result<Self> {
        let cfg: Self = if figment.contains(key) {
            figment.extract_inner(key)?
        } else {
            Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// Returns `DbError::InvalidConfig` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_conns == 0 {
            return Err(DbError::InvalidConfig(
                "pool.max_conns must be at least 1".to_owned(),
            ));
        }
        if self.pool.acquire_timeout.is_zero() {
            return Err(DbError::InvalidConfig(
                "pool.acquire_timeout must be greater than zero".to_owned(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(DbError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(DbError::InvalidConfig(
                "retry.initial_backoff must not exceed retry.max_backoff".to_owned(),
            ));
        }
        self.postgres.validate()
    }

    #[must_use]
    pub fn tx_defaults(&self) -> TxConfig {
        TxConfig {
            isolation: self.isolation,
            access_mode: None,
        }
    }
}

/// Connection pool knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolCfg {
    /// Upper bound on open connections.
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,

    /// How long a borrower may wait for a connection before `PoolExhausted`.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Idle connections older than this are closed instead of reused.
    #[serde(default = "default_idle_timeout", with = "humantime_serde::option")]
    pub idle_timeout: Option<Duration>,

    /// Connections older than this are closed instead of reused.
    #[serde(default = "default_max_lifetime", with = "humantime_serde::option")]
    pub max_lifetime: Option<Duration>,

    /// Ping idle connections before handing them out.
    pub test_before_acquire: bool,
}

fn default_max_conns() -> u32 {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

#[allow(clippy::unnecessary_wraps)]
fn default_idle_timeout() -> Option<Duration> {
    Some(Duration::from_secs(10 * 60))
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_lifetime() -> Option<Duration> {
    Some(Duration::from_secs(30 * 60))
}

impl Default for PoolCfg {
    fn default() -> Self {
        Self {
            max_conns: default_max_conns(),
            acquire_timeout: default_acquire_timeout(),
            idle_timeout: default_idle_timeout(),
            max_lifetime: default_max_lifetime(),
            test_before_acquire: false,
        }
    }
}

impl PoolCfg {
    /// Pool with `max_conns` connections and default timeouts.
    #[must_use]
    pub fn sized(max_conns: u32) -> Self {
        Self {
            max_conns,
            ..Self::default()
        }
    }
}

/// Retry policy for transaction conflicts at the transaction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryCfg {
    /// Total attempts, including the first one. `1` disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(10)
}

fn default_max_backoff() -> Duration {
    Duration::from_millis(500)
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryCfg {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before re-running after failed attempt number `attempt` (1-based):
    /// `initial_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Names of the session settings the PostgreSQL row-level-security policies
/// read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PgScopeSettings {
    #[serde(default = "default_tenant_setting")]
    pub tenant_setting: String,

    #[serde(default = "default_bypass_setting")]
    pub bypass_setting: String,
}

fn default_tenant_setting() -> String {
    "app.tenant_id".to_owned()
}

fn default_bypass_setting() -> String {
    "app.bypass_rls".to_owned()
}

impl Default for PgScopeSettings {
    fn default() -> Self {
        Self {
            tenant_setting: default_tenant_setting(),
            bypass_setting: default_bypass_setting(),
        }
    }
}

impl PgScopeSettings {
    /// Custom settings must be two-part names such as `app.tenant_id`.
    ///
    /// # Errors
    /// Returns `DbError::InvalidConfig` for malformed setting names.
    pub fn validate(&self) -> Result<()> {
        for name in [&self.tenant_setting, &self.bypass_setting] {
            let valid = name.split_once('.').is_some_and(|(ns, key)| {
                crate::engine::validate_identifier(ns).is_ok()
                    && crate::engine::validate_identifier(key).is_ok()
            });
            if !valid {
                return Err(DbError::InvalidConfig(format!(
                    "session setting {name:?} must look like \"namespace.name\""
                )));
            }
        }
        if self.tenant_setting == self.bypass_setting {
            return Err(DbError::InvalidConfig(
                "tenant and bypass settings must differ".to_owned(),
            ));
        }
        Ok(())
    }
}
