#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Loading the `tenant_db` configuration section through figment.

use std::io::Write;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use tenant_db::tenant::StaticTenantsConfig;
use tenant_db::{
    DbError, MemoryEngine, PoolCfg, RetryCfg, StaticTenantResolver, TenantDb, TenantDbConfig,
    TenantId, TenantResolver, TxIsolationLevel,
};

#[test]
fn missing_section_falls_back_to_defaults() {
    let figment = Figment::new().merge(Serialized::defaults(serde_json::json!({
        "server": { "port": 8080 }
    })));
    let cfg = TenantDbConfig::from_figment(&figment, "tenant_db").unwrap();
    assert_eq!(cfg, TenantDbConfig::default());
    assert_eq!(cfg.pool, PoolCfg::default());
    assert_eq!(cfg.retry.max_attempts, 3);
    assert_eq!(cfg.postgres.tenant_setting, "app.tenant_id");
}

#[test]
fn yaml_file_with_human_durations() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r"
tenant_db:
  pool:
    max_conns: 20
    acquire_timeout: 5s
    idle_timeout: 2m
  retry:
    max_attempts: 4
    initial_backoff: 20ms
    max_backoff: 1s
  isolation: serializable
  postgres:
    tenant_setting: cms.tenant
    bypass_setting: cms.bypass
tenants:
  tenants:
    - id: 7
      name: acme
    - id: 8
      name: globex
      status: suspended
"
    )
    .unwrap();

    let figment = Figment::new().merge(Yaml::file(file.path()));
    let cfg = TenantDbConfig::from_figment(&figment, "tenant_db").unwrap();
    assert_eq!(cfg.pool.max_conns, 20);
    assert_eq!(cfg.pool.acquire_timeout, Duration::from_secs(5));
    assert_eq!(cfg.pool.idle_timeout, Some(Duration::from_secs(120)));
    assert_eq!(cfg.pool.max_lifetime, PoolCfg::default().max_lifetime);
    assert_eq!(cfg.retry.initial_backoff, Duration::from_millis(20));
    assert_eq!(cfg.retry.backoff(3), Duration::from_millis(80));
    assert_eq!(cfg.tx_defaults().isolation, Some(TxIsolationLevel::Serializable));
    assert_eq!(cfg.postgres.bypass_setting, "cms.bypass");

    let tenants: StaticTenantsConfig = figment.extract_inner("tenants").unwrap();
    let resolver = StaticTenantResolver::from_config(&tenants).unwrap();
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    assert_eq!(
        rt.block_on(resolver.resolve(7)).unwrap(),
        TenantId::new(7).unwrap()
    );
    assert!(matches!(
        rt.block_on(resolver.resolve(8)),
        Err(DbError::TenantResolution(_))
    ));
}

#[test]
fn environment_overrides_file_values() {
    figment::Jail::expect_with(|jail| {
        jail.create_file(
            "app.yaml",
            r"
tenant_db:
  pool:
    max_conns: 20
",
        )?;
        jail.set_env("APP_TENANT_DB__POOL__MAX_CONNS", "4");
        jail.set_env("APP_TENANT_DB__RETRY__INITIAL_BACKOFF", "250ms");
        jail.set_env("APP_TENANT_DB__RETRY__MAX_BACKOFF", "2s");

        let figment = Figment::new()
            .merge(Yaml::file("app.yaml"))
            .merge(Env::prefixed("APP_").split("__"));
        let cfg = TenantDbConfig::from_figment(&figment, "tenant_db").unwrap();
        assert_eq!(cfg.pool.max_conns, 4);
        assert_eq!(cfg.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(cfg.retry.max_backoff, Duration::from_secs(2));
        Ok(())
    });
}

#[test]
fn out_of_range_values_are_rejected() {
    let zero_pool = Figment::new().merge(Serialized::defaults(serde_json::json!({
        "tenant_db": { "pool": { "max_conns": 0 } }
    })));
    let err = TenantDbConfig::from_figment(&zero_pool, "tenant_db").unwrap_err();
    assert!(matches!(err, DbError::InvalidConfig(_)));

    let inverted = TenantDbConfig {
        retry: RetryCfg {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_millis(10),
            ..RetryCfg::default()
        },
        ..TenantDbConfig::default()
    };
    assert!(matches!(inverted.validate(), Err(DbError::InvalidConfig(_))));

    let same_setting = Figment::new().merge(Serialized::defaults(serde_json::json!({
        "tenant_db": { "postgres": { "bypass_setting": "app.tenant_id" } }
    })));
    assert!(TenantDbConfig::from_figment(&same_setting, "tenant_db").is_err());
}

#[test]
fn unknown_keys_are_a_config_error() {
    let figment = Figment::new().merge(Serialized::defaults(serde_json::json!({
        "tenant_db": { "pool": { "max_connections": 5 } }
    })));
    let err = TenantDbConfig::from_figment(&figment, "tenant_db").unwrap_err();
    assert!(matches!(err, DbError::Config(_)));
    assert!(err.to_string().contains("max_connections"));
}

#[tokio::test]
async fn coordinator_is_built_from_config() {
    let cfg = TenantDbConfig {
        pool: PoolCfg::sized(3),
        retry: RetryCfg::disabled(),
        ..TenantDbConfig::default()
    };
    let db = TenantDb::from_config(MemoryEngine::new(), &cfg).unwrap();
    assert_eq!(db.pool().status().max_conns, 3);

    let bad = TenantDbConfig {
        pool: PoolCfg::sized(0),
        ..TenantDbConfig::default()
    };
    assert!(matches!(
        TenantDb::from_config(MemoryEngine::new(), &bad),
        Err(DbError::InvalidConfig(_))
    ));
}
