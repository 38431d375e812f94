//! Scoping attribute of a storage connection and the scopes callers may request.
//!
//! | Request | Connection attribute | Visible rows |
//! |---------|----------------------|--------------|
//! | (none, idle in pool) | `Neutral` | none |
//! | `TxScope::Tenant(t)` | `Tenant(t)` | `tenant_id = t` |
//! | `TxScope::Bypass(grant)` | `Bypass` | all tenants |

use std::fmt;

use crate::tenant::TenantId;

/// Scoping attribute as set on a storage connection.
///
/// Only the scope manager changes this value, and only at borrow/release
/// boundaries. A connection sitting idle in the pool is always `Neutral`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeState {
    #[default]
    Neutral,
    Tenant(TenantId),
    Bypass,
}

impl ScopeState {
    #[must_use]
    pub fn tenant(self) -> Option<TenantId> {
        match self {
            Self::Tenant(id) => Some(id),
            Self::Neutral | Self::Bypass => None,
        }
    }

    #[must_use]
    pub fn is_neutral(self) -> bool {
        matches!(self, Self::Neutral)
    }

    #[must_use]
    pub fn is_bypass(self) -> bool {
        matches!(self, Self::Bypass)
    }
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Neutral => f.write_str("neutral"),
            Self::Tenant(id) => write!(f, "tenant:{id}"),
            Self::Bypass => f.write_str("bypass"),
        }
    }
}

/// Capability to open a privileged, unfiltered scope.
///
/// A grant can only be built from a `'static` reason string, so it is always
/// spelled out in code at a system entrypoint (cron job, public slug lookup,
/// platform report) and never derived from request data:
///
/// ```
/// use tenant_db::BypassGrant;
///
/// let grant = BypassGrant::system("nightly subscription renewal");
/// assert_eq!(grant.reason(), "nightly subscription renewal");
/// ```
///
/// ```compile_fail
/// use tenant_db::BypassGrant;
///
/// let from_request = String::from("tenant-supplied");
/// let grant = BypassGrant::system(&from_request);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BypassGrant {
    reason: &'static str,
}

impl BypassGrant {
    #[must_use]
    pub const fn system(reason: &'static str) -> Self {
        Self { reason }
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// Scope requested for a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxScope {
    Tenant(TenantId),
    Bypass(BypassGrant),
}

impl TxScope {
    #[must_use]
    pub fn state(&self) -> ScopeState {
        match self {
            Self::Tenant(id) => ScopeState::Tenant(*id),
            Self::Bypass(_) => ScopeState::Bypass,
        }
    }
}

impl From<TenantId> for TxScope {
    fn from(id: TenantId) -> Self {
        Self::Tenant(id)
    }
}

impl From<BypassGrant> for TxScope {
    fn from(grant: BypassGrant) -> Self {
        Self::Bypass(grant)
    }
}

impl fmt::Display for TxScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.state(), f)
    }
}
