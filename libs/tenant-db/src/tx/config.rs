//! Transaction configuration.
//!
//! Domain services pick isolation and access mode here without touching any
//! engine type; each storage engine turns a [`TxConfig`] into its own
//! begin statement.
//!
//! ```
//! use tenant_db::{TxConfig, TxIsolationLevel};
//!
//! let cfg = TxConfig::with_isolation(TxIsolationLevel::RepeatableRead);
//! assert_eq!(cfg.begin_statement(), "BEGIN ISOLATION LEVEL REPEATABLE READ");
//! ```

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
///
/// # Backend Notes
///
/// - **`PostgreSQL`**: Supports all levels. `RepeatableRead` actually uses
///   snapshot isolation; `Serializable` may fail commits with SQLSTATE
///   `40001`, which the coordinator retries.
/// - **In-memory engine**: Reads see committed data plus the transaction's own
///   writes; written and locked rows are held until the transaction ends.
///   The level is accepted and otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxIsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl TxIsolationLevel {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Transaction access mode.
///
/// A `ReadOnly` transaction rejects writes on every engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxAccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl TxAccessMode {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadOnly => "READ ONLY",
            Self::ReadWrite => "READ WRITE",
        }
    }
}

/// Configuration for one transaction. `None` fields keep the engine default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxConfig {
    pub isolation: Option<TxIsolationLevel>,
    pub access_mode: Option<TxAccessMode>,
}

impl TxConfig {
    #[must_use]
    pub fn with_isolation(isolation: TxIsolationLevel) -> Self {
        Self {
            isolation: Some(isolation),
            access_mode: None,
        }
    }

    #[must_use]
    pub fn read_only() -> Self {
        Self {
            isolation: None,
            access_mode: Some(TxAccessMode::ReadOnly),
        }
    }

    #[must_use]
    pub fn serializable() -> Self {
        Self::with_isolation(TxIsolationLevel::Serializable)
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.access_mode == Some(TxAccessMode::ReadOnly)
    }

    /// SQL `BEGIN` statement carrying this configuration.
    #[must_use]
    pub fn begin_statement(&self) -> String {
        let mut stmt = String::from("BEGIN");
        if let Some(level) = self.isolation {
            stmt.push_str(" ISOLATION LEVEL ");
            stmt.push_str(level.as_sql());
        }
        if let Some(mode) = self.access_mode {
            stmt.push(' ');
            stmt.push_str(mode.as_sql());
        }
        stmt
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_keeps_engine_defaults() {
        let cfg = TxConfig::default();
        assert!(cfg.isolation.is_none());
        assert!(cfg.access_mode.is_none());
        assert_eq!(cfg.begin_statement(), "BEGIN");
    }

    #[test]
    fn read_only_renders_access_mode() {
        let cfg = TxConfig::read_only();
        assert!(cfg.is_read_only());
        assert_eq!(cfg.begin_statement(), "BEGIN READ ONLY");
    }

    #[test]
    fn serializable_read_write_renders_both_clauses() {
        let cfg = TxConfig {
            access_mode: Some(TxAccessMode::ReadWrite),
            ..TxConfig::serializable()
        };
        assert_eq!(
            cfg.begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE READ WRITE"
        );
    }

    #[test]
    fn isolation_level_parses_from_config_value() {
        let level: TxIsolationLevel = serde_json::from_str("\"repeatable_read\"").unwrap();
        assert_eq!(level, TxIsolationLevel::RepeatableRead);
    }
}
