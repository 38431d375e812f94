//! Optimistic concurrency: version-guarded writes for collaboratively edited
//! records.
//!
//! A caller reads a record with its [`Version`], edits it, and submits the new
//! field set together with the version it read. [`update_versioned`] issues
//! one atomic conditional write. If zero rows match it performs exactly one
//! follow-up read: a missing row is [`DbError::NotFound`], a row with another
//! version is [`DbError::OptimisticConflict`]. Conflicts are never retried
//! here; the caller must reload and resubmit.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::engine::{
    Fields, RowId, StorageConn, VersionedWrite, strip_reserved, validate_identifier,
};
use crate::error::{DbError, Result};
use crate::runner::{DbRunner, RunnerInternal};
use crate::tenant::TenantId;

/// Version counter of a record. Starts at 1 and grows by exactly one per
/// successful update. Opaque to API consumers, who only echo it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Version(i64);

impl Version {
    pub const INITIAL: Self = Self(1);

    /// # Errors
    /// Returns `DbError::Storage` if `raw` is below 1.
    pub fn new(raw: i64) -> Result<Self> {
        if raw >= 1 {
            Ok(Self(raw))
        } else {
            Err(DbError::Storage(format!("version must be >= 1, got {raw}")))
        }
    }

    #[inline]
    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }

    /// Only storage engines advance versions.
    ///
    /// # Errors
    /// Returns `DbError::Storage` once the counter cannot grow any further.
    pub(crate) fn next(self) -> Result<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or_else(|| DbError::Storage(format!("version {self} cannot be advanced")))
    }
}

impl TryFrom<i64> for Version {
    type Error = DbError;

    fn try_from(raw: i64) -> Result<Self> {
        Self::new(raw)
    }
}

impl From<Version> for i64 {
    fn from(v: Version) -> Self {
        v.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row together with its core-owned columns.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub id: RowId,
    pub tenant_id: TenantId,
    pub version: Version,
    pub fields: Fields,
}

impl VersionedRecord {
    /// Rebuilds a typed entity from the record.
    ///
    /// # Errors
    /// Returns `DbError::Json` if the fields don't match `T`.
    pub fn into_entity<T: DeserializeOwned>(self) -> Result<T> {
        let mut obj = self.fields;
        obj.insert("id".to_owned(), Value::from(self.id.0));
        obj.insert("tenant_id".to_owned(), Value::from(self.tenant_id.get()));
        obj.insert("version".to_owned(), Value::from(self.version.get()));
        Ok(serde_json::from_value(Value::Object(obj))?)
    }

    /// Copy with `changes` merged in and the version advanced.
    pub(crate) fn updated(&self, changes: &Fields) -> Result<Self> {
        let mut fields = self.fields.clone();
        for (k, v) in changes {
            fields.insert(k.clone(), v.clone());
        }
        Ok(Self {
            id: self.id,
            tenant_id: self.tenant_id,
            version: self.version.next()?,
            fields,
        })
    }

    /// Parses a row rendered as a JSON object (e.g. `to_jsonb(t.*)`).
    #[cfg_attr(not(feature = "pg"), allow(dead_code))]
    pub(crate) fn from_row_json(row: Value) -> Result<Self> {
        let Value::Object(mut fields) = row else {
            return Err(DbError::Storage("row is not a JSON object".to_owned()));
        };
        let mut take = |col: &str| -> Result<i64> {
            fields
                .remove(col)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| DbError::Storage(format!("row has no integer column {col:?}")))
        };
        let id = RowId(take("id")?);
        let tenant_id = TenantId::new(take("tenant_id")?)?;
        let version = Version::new(take("version")?)?;
        Ok(Self {
            id,
            tenant_id,
            version,
            fields,
        })
    }
}

/// A typed record participating in optimistic concurrency.
///
/// The serialized form must carry `id`, `tenant_id` and `version` fields.
pub trait Versioned: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: &'static str;

    fn id(&self) -> RowId;

    fn version(&self) -> Version;
}

/// Reads one record visible under the runner's scope.
///
/// # Errors
/// Returns `DbError::NotFound` if the row is absent or belongs to another tenant.
pub async fn fetch<R: DbRunner>(runner: &mut R, table: &str, id: RowId) -> Result<VersionedRecord> {
    validate_identifier(table)?;
    let tenant = runner.scope().tenant();
    runner
        .storage()
        .read_record(table, id, tenant)
        .await?
        .ok_or_else(|| DbError::NotFound {
            table: table.to_owned(),
            id,
        })
}

/// # Errors
/// Same as [`fetch`], plus `DbError::Json` if the row doesn't match `T`.
pub async fn fetch_entity<T: Versioned, R: DbRunner>(runner: &mut R, id: RowId) -> Result<T> {
    fetch(runner, T::TABLE, id).await?.into_entity()
}

/// Version-guarded update of one row.
///
/// `fields` is the full new field set; `id`, `tenant_id` and `version` are
/// ignored if present. On success the returned record carries `expected + 1`.
///
/// # Errors
/// - `DbError::NotFound` if the row is absent under the current scope
/// - `DbError::OptimisticConflict` if the row's version differs from `expected`
/// - `DbError::InvalidIdentifier` for unsafe table or column names
#[tracing::instrument(skip_all, fields(table = %table, id = %id, expected = %expected))]
pub async fn update_versioned<R: DbRunner>(
    runner: &mut R,
    table: &str,
    id: RowId,
    expected: Version,
    fields: Fields,
) -> Result<VersionedRecord> {
    validate_identifier(table)?;
    let fields = strip_reserved(fields);
    for column in fields.keys() {
        validate_identifier(column)?;
    }
    let tenant = runner.scope().tenant();
    let write = VersionedWrite {
        table,
        id,
        tenant,
        expected,
        fields: &fields,
    };

    if let Some(record) = runner.storage().update_if_version(&write).await? {
        return Ok(record);
    }

    match runner.storage().read_record(table, id, tenant).await? {
        None => Err(DbError::NotFound {
            table: table.to_owned(),
            id,
        }),
        Some(current) => {
            debug!(current = %current.version, "conditional write lost");
            Err(DbError::OptimisticConflict {
                table: table.to_owned(),
                id,
                expected,
                current: current.version,
            })
        }
    }
}

/// Saves an edited entity using the version it was read with.
///
/// # Errors
/// Same as [`update_versioned`].
pub async fn update_entity<T: Versioned, R: DbRunner>(runner: &mut R, entity: &T) -> Result<T> {
    let Value::Object(fields) = serde_json::to_value(entity)? else {
        return Err(DbError::Storage(format!(
            "{} entity must serialize to an object",
            T::TABLE
        )));
    };
    update_versioned(runner, T::TABLE, entity.id(), entity.version(), fields)
        .await?
        .into_entity()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_starts_at_one() {
        assert!(Version::new(0).is_err());
        assert_eq!(Version::INITIAL.get(), 1);
        assert_eq!(Version::new(5).unwrap().next().unwrap().get(), 6);
        assert!(serde_json::from_str::<Version>("0").is_err());
    }

    #[test]
    fn row_json_splits_core_columns() {
        let rec = VersionedRecord::from_row_json(
            json!({"id": 4, "tenant_id": 7, "version": 2, "title": "Home"}),
        )
        .unwrap();
        assert_eq!(rec.id, RowId(4));
        assert_eq!(rec.tenant_id.get(), 7);
        assert_eq!(rec.version.get(), 2);
        assert_eq!(rec.fields.get("title"), Some(&json!("Home")));
        assert!(!rec.fields.contains_key("version"));
    }

    #[test]
    fn row_json_without_version_is_rejected() {
        assert!(VersionedRecord::from_row_json(json!({"id": 4, "tenant_id": 7})).is_err());
        assert!(VersionedRecord::from_row_json(json!([1, 2])).is_err());
    }

    #[test]
    fn updated_merges_and_bumps() {
        let rec = VersionedRecord::from_row_json(
            json!({"id": 1, "tenant_id": 3, "version": 5, "title": "a", "body": "b"}),
        )
        .unwrap();
        let mut changes = Fields::new();
        changes.insert("title".to_owned(), json!("c"));
        let next = rec.updated(&changes).unwrap();
        assert_eq!(next.version.get(), 6);
        assert_eq!(next.fields.get("title"), Some(&json!("c")));
        assert_eq!(next.fields.get("body"), Some(&json!("b")));
    }

    #[test]
    fn exhausted_version_counter_refuses_the_write() {
        let last = Version::new(i64::MAX).unwrap();
        assert!(matches!(last.next(), Err(DbError::Storage(_))));

        let rec = VersionedRecord::from_row_json(
            json!({"id": 1, "tenant_id": 3, "version": i64::MAX, "title": "a"}),
        )
        .unwrap();
        assert!(matches!(rec.updated(&Fields::new()), Err(DbError::Storage(_))));
    }
}
