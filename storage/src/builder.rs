use crate::config::{BackendConfig, LockConfig};
use lease::{Clock, InMemoryLeaseStore, LeaseStore, LockManager, Result};
use std::sync::Arc;
use tracing::info;

/// Constructs a [`LockManager`] over the backend a [`LockConfig`] names.
#[derive(Debug)]
pub struct LockManagerBuilder {
    config: LockConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl LockManagerBuilder {
    pub fn new(config: LockConfig) -> Self {
        Self { config, clock: None }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Opens the configured store. The lease table is created on first use.
    pub async fn build_store(&self) -> Result<Arc<dyn LeaseStore>> {
        self.config.validate()?;
        let table = self.config.resolve_table_name();

        let store: Arc<dyn LeaseStore> = match &self.config.backend {
            BackendConfig::Memory => Arc::new(InMemoryLeaseStore::new()),
            BackendConfig::Sqlite { path } => open_sqlite(path, &table).await?,
            BackendConfig::Postgres { url, max_connections } => {
                open_postgres(url, *max_connections, &table).await?
            }
        };
        info!(backend = backend_kind(&self.config.backend), %table, "lease store opened");
        Ok(store)
    }

    pub async fn build(self) -> Result<LockManager> {
        let store = self.build_store().await?;
        let mut manager = LockManager::new(store).with_scope_options(self.config.scope.clone())?;
        if let Some(clock) = self.clock {
            manager = manager.with_clock(clock);
        }
        Ok(manager)
    }
}

fn backend_kind(backend: &BackendConfig) -> &'static str {
    match backend {
        BackendConfig::Memory => "memory",
        BackendConfig::Sqlite { .. } => "sqlite",
        BackendConfig::Postgres { .. } => "postgres",
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(path: &std::path::Path, table: &str) -> Result<Arc<dyn LeaseStore>> {
    use crate::sqlite::SqliteLeaseStore;

    let path = path.to_path_buf();
    let table = table.to_string();
    let store = tokio::task::spawn_blocking(move || {
        if path.as_os_str() == ":memory:" {
            SqliteLeaseStore::open_in_memory(&table)
        } else {
            SqliteLeaseStore::open(&path, &table)
        }
    })
    .await
    .map_err(lease::StoreError::from)??;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_path: &std::path::Path, _table: &str) -> Result<Arc<dyn LeaseStore>> {
    Err(lease::Error::Config(
        "sqlite backend requested but the `sqlite` feature is disabled".into(),
    ))
}

#[cfg(feature = "postgres")]
async fn open_postgres(url: &str, max_connections: u32, table: &str) -> Result<Arc<dyn LeaseStore>> {
    let store = crate::postgres::PgLeaseStore::connect(url, max_connections, table).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_url: &str, _max_connections: u32, _table: &str) -> Result<Arc<dyn LeaseStore>> {
    Err(lease::Error::Config(
        "postgres backend requested but the `postgres` feature is disabled".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lease::{ManualClock, ScopeOptions};

    #[tokio::test]
    async fn test_builds_memory_manager() {
        let clock = Arc::new(ManualClock::new());
        let manager = LockManagerBuilder::new(LockConfig::memory())
            .with_clock(clock.clone())
            .build()
            .await
            .unwrap();

        let token = manager.create("job", 1000).await.unwrap();
        assert!(token.is_some());
        clock.advance_ms(1001);
        assert!(!manager.exists("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_scope_policy_reaches_manager() {
        let scope = ScopeOptions {
            lock_duration_ms: 2000,
            renew_threshold_ms: 500,
            poll_interval_ms: 50,
            max_renew_failures: 1,
        };
        let manager = LockManagerBuilder::new(LockConfig::memory().scope(scope.clone()))
            .build()
            .await
            .unwrap();
        assert_eq!(manager.scope_options(), &scope);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_opening() {
        let err = LockManagerBuilder::new(LockConfig::memory().table_name(""))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, lease::Error::Config(_)));
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_postgres_requires_feature() {
        let err = LockManagerBuilder::new(LockConfig::postgres("postgres://localhost/locks"))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, lease::Error::Config(_)));
    }
}
