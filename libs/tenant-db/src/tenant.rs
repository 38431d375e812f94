//! Tenant identity and resolution.
//!
//! The scope manager trusts the [`TenantId`] it is given. Turning untrusted
//! caller input into a `TenantId` is the job of a [`TenantResolver`].

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DbError, Result};

/// Identifier of a tenant: a positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct TenantId(i64);

impl TenantId {
    /// # Errors
    /// Returns `DbError::TenantResolution` if `raw` is not positive.
    pub fn new(raw: i64) -> Result<Self> {
        if raw > 0 {
            Ok(Self(raw))
        } else {
            Err(DbError::TenantResolution(format!(
                "tenant id must be a positive integer, got {raw}"
            )))
        }
    }

    #[inline]
    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for TenantId {
    type Error = DbError;

    fn try_from(raw: i64) -> Result<Self> {
        Self::new(raw)
    }
}

impl From<TenantId> for i64 {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves untrusted tenant input into a [`TenantId`] the core can trust.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// # Errors
    /// Returns `DbError::TenantResolution` for invalid, unknown or suspended tenants.
    async fn resolve(&self, raw: i64) -> Result<TenantId>;
}

/// Lifecycle state of a configured tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Active,
    Suspended,
}

/// Configuration for a single statically known tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantEntry {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub status: TenantStatus,
}

/// Static tenant list, typically loaded from the `tenants` config section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StaticTenantsConfig {
    pub tenants: Vec<TenantEntry>,
}

/// Resolver backed by a fixed tenant list. Useful for tests, development and
/// single-node deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantResolver {
    tenants: HashMap<TenantId, TenantStatus>,
}

impl StaticTenantResolver {
    /// # Errors
    /// Returns `DbError::InvalidConfig` if an entry has a non-positive id or
    /// appears twice.
    pub fn from_config(cfg: &StaticTenantsConfig) -> Result<Self> {
        let mut tenants = HashMap::with_capacity(cfg.tenants.len());
        for entry in &cfg.tenants {
            let id = TenantId::new(entry.id)
                .map_err(|e| DbError::InvalidConfig(format!("tenant '{}': {e}", entry.name)))?;
            if tenants.insert(id, entry.status).is_some() {
                return Err(DbError::InvalidConfig(format!(
                    "tenant id {id} is configured more than once"
                )));
            }
        }
        Ok(Self { tenants })
    }

    #[must_use]
    pub fn active(ids: impl IntoIterator<Item = TenantId>) -> Self {
        Self {
            tenants: ids
                .into_iter()
                .map(|id| (id, TenantStatus::Active))
                .collect(),
        }
    }
}

#[async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn resolve(&self, raw: i64) -> Result<TenantId> {
        let id = TenantId::new(raw)?;
        match self.tenants.get(&id) {
            Some(TenantStatus::Active) => Ok(id),
            Some(TenantStatus::Suspended) => {
                debug!(tenant.id = %id, "rejecting suspended tenant");
                Err(DbError::TenantResolution(format!("tenant {id} is suspended")))
            }
            None => Err(DbError::TenantResolution(format!("unknown tenant {id}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_must_be_positive() {
        assert!(TenantId::new(0).is_err());
        assert!(TenantId::new(-4).is_err());
        assert_eq!(TenantId::new(7).map(TenantId::get).ok(), Some(7));
    }

    #[test]
    fn tenant_id_deserialization_validates() {
        let ok: TenantId = serde_json::from_str("12").unwrap();
        assert_eq!(ok.get(), 12);
        assert!(serde_json::from_str::<TenantId>("0").is_err());
    }

    #[tokio::test]
    async fn static_resolver_rejects_unknown_and_suspended() {
        let cfg = StaticTenantsConfig {
            tenants: vec![
                TenantEntry {
                    id: 7,
                    name: "Acme".to_owned(),
                    status: TenantStatus::Active,
                },
                TenantEntry {
                    id: 9,
                    name: "Dormant".to_owned(),
                    status: TenantStatus::Suspended,
                },
            ],
        };
        let resolver = StaticTenantResolver::from_config(&cfg).unwrap();

        assert_eq!(resolver.resolve(7).await.unwrap().get(), 7);
        assert!(matches!(
            resolver.resolve(9).await,
            Err(DbError::TenantResolution(_))
        ));
        assert!(matches!(
            resolver.resolve(8).await,
            Err(DbError::TenantResolution(_))
        ));
        assert!(matches!(
            resolver.resolve(-1).await,
            Err(DbError::TenantResolution(_))
        ));
    }

    #[test]
    fn duplicate_tenants_are_a_config_error() {
        let entry = TenantEntry {
            id: 3,
            name: "Twice".to_owned(),
            status: TenantStatus::Active,
        };
        let cfg = StaticTenantsConfig {
            tenants: vec![entry.clone(), entry],
        };
        assert!(matches!(
            StaticTenantResolver::from_config(&cfg),
            Err(DbError::InvalidConfig(_))
        ));
    }
}
