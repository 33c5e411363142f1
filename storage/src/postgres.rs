//! PostgreSQL lease table over an `sqlx` pool.

use crate::scripts::{Dialect, Scripts};
use async_trait::async_trait;
use lease::{LeaseRecord, LeaseStore, StoreError, StoreResult, Timestamp, Token};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const UNIQUE_VIOLATION: &str = "23505";

type RawRow = (String, String, Timestamp, i64);

#[derive(Debug)]
pub struct PgLeaseStore {
    pool: PgPool,
    scripts: Scripts,
    schema_ready: AtomicBool,
}

impl PgLeaseStore {
    pub async fn connect(url: &str, max_connections: u32, table: &str) -> lease::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StoreError::backend("connect to postgres", e))?;
        Self::with_pool(pool, table)
    }

    pub fn with_pool(pool: PgPool, table: &str) -> lease::Result<Self> {
        Ok(Self {
            pool,
            scripts: Scripts::new(Dialect::Postgres, table)?,
            schema_ready: AtomicBool::new(false),
        })
    }

    pub fn table(&self) -> &str {
        self.scripts.table()
    }

    /// Provisions the table on first use, and again after `drop_table`.
    /// Creation is idempotent, so racing callers are harmless.
    async fn ready(&self) -> StoreResult<()> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.ensure_table_exists().await
    }

    async fn read_one(&self, sql: &str, key: &str) -> StoreResult<Option<LeaseRecord>> {
        self.ready().await?;
        let row: Option<RawRow> = sqlx::query_as(sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::backend("read lease", e))?;
        Ok(row.map(|(resource_name, token, expires_on, lock_duration_ms)| LeaseRecord {
            resource_name,
            token: Token::from(token),
            expires_on,
            lock_duration_ms,
        }))
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn insert(&self, record: &LeaseRecord) -> StoreResult<()> {
        self.ready().await?;
        sqlx::query(&self.scripts.insert())
            .bind(&record.resource_name)
            .bind(record.token.as_str())
            .bind(record.expires_on)
            .bind(record.lock_duration_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("insert lease", e))?;
        Ok(())
    }

    async fn read_by_resource(&self, resource_name: &str) -> StoreResult<Option<LeaseRecord>> {
        self.read_one(&self.scripts.select_by_resource(), resource_name)
            .await
    }

    async fn read_by_token(&self, token: &Token) -> StoreResult<Option<LeaseRecord>> {
        self.read_one(&self.scripts.select_by_token(), token.as_str())
            .await
    }

    async fn update(&self, record: &LeaseRecord) -> StoreResult<bool> {
        self.ready().await?;
        let result = sqlx::query(&self.scripts.update())
            .bind(record.expires_on)
            .bind(record.lock_duration_ms)
            .bind(record.token.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("update lease", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_token(&self, token: &Token) -> StoreResult<()> {
        self.ready().await?;
        sqlx::query(&self.scripts.delete_by_token())
            .bind(token.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("delete lease", e))?;
        Ok(())
    }

    async fn delete_expired(&self, resource_name: &str, now: Timestamp) -> StoreResult<u64> {
        self.ready().await?;
        let result = sqlx::query(&self.scripts.delete_expired())
            .bind(resource_name)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("delete expired lease", e))?;
        Ok(result.rows_affected())
    }

    fn is_unique_key_violation(&self, err: &StoreError) -> bool {
        match err.backend_source::<sqlx::Error>() {
            Some(sqlx::Error::Database(db)) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
            _ => false,
        }
    }

    async fn ensure_table_exists(&self) -> StoreResult<()> {
        sqlx::query(&self.scripts.create_table())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("create lease table", e))?;
        sqlx::query(&self.scripts.create_token_index())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("create token index", e))?;
        debug!(table = self.scripts.table(), "postgres lease table ready");
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn table_exists(&self) -> StoreResult<bool> {
        // unquoted identifiers are folded to lower case
        let count: i64 = sqlx::query_scalar(self.scripts.table_exists())
            .bind(self.scripts.table().to_ascii_lowercase())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::backend("look up lease table", e))?;
        Ok(count > 0)
    }

    async fn drop_table(&self) -> StoreResult<()> {
        self.schema_ready.store(false, Ordering::Release);
        sqlx::query(&self.scripts.drop_table())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::backend("drop lease table", e))?;
        Ok(())
    }
}
