//! SQLite lease table.
//!
//! Every process opening the same database file shares the table. Statements
//! run on tokio's blocking pool against one connection per store.

use crate::scripts::{Dialect, Scripts};
use async_trait::async_trait;
use lease::{
    time::{parse_utc, to_storage_text},
    LeaseRecord, LeaseStore, StoreError, StoreResult, Timestamp, Token,
};
use parking_lot::Mutex;
use rusqlite::{ffi, params, Connection, OptionalExtension};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type RawRow = (String, String, String, i64);

#[derive(Debug)]
pub struct SqliteLeaseStore {
    conn: Arc<Mutex<Connection>>,
    scripts: Arc<Scripts>,
    schema_ready: AtomicBool,
}

impl SqliteLeaseStore {
    pub fn open(path: impl AsRef<Path>, table: &str) -> lease::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::backend("open sqlite db", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StoreError::backend("set busy_timeout", e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::backend("set journal_mode", e))?;
        Self::with_connection(conn, table)
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory(table: &str) -> lease::Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::backend("open sqlite db", e))?;
        Self::with_connection(conn, table)
    }

    pub fn with_connection(conn: Connection, table: &str) -> lease::Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StoreError::backend("set busy_timeout", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            scripts: Arc::new(Scripts::new(Dialect::Sqlite, table)?),
            schema_ready: AtomicBool::new(false),
        })
    }

    pub fn table(&self) -> &str {
        self.scripts.table()
    }

    async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &Scripts) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let scripts = self.scripts.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            op(&conn, &scripts)
        })
        .await?
    }

    /// Provisions the table on first use, and again after `drop_table`.
    /// Creation is idempotent, so racing callers are harmless.
    async fn ready(&self) -> StoreResult<()> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.ensure_table_exists().await
    }
}

fn map_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| StoreError::backend(context, e)
}

fn into_record((resource_name, token, expires_on, lock_duration_ms): RawRow) -> StoreResult<LeaseRecord> {
    let expires_on = parse_utc(&expires_on)
        .map_err(|e| StoreError::Corrupt(format!("ExpiresOn for {resource_name:?}: {e}")))?;
    Ok(LeaseRecord {
        resource_name,
        token: Token::from(token),
        expires_on,
        lock_duration_ms,
    })
}

fn read_one(conn: &Connection, sql: &str, key: &str) -> StoreResult<Option<LeaseRecord>> {
    conn.query_row::<RawRow, _, _>(sql, params![key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })
    .optional()
    .map_err(map_err("read lease"))?
    .map(into_record)
    .transpose()
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn insert(&self, record: &LeaseRecord) -> StoreResult<()> {
        self.ready().await?;
        let record = record.clone();
        self.run(move |conn, scripts| {
            conn.execute(
                &scripts.insert(),
                params![
                    record.resource_name,
                    record.token.as_str(),
                    to_storage_text(&record.expires_on),
                    record.lock_duration_ms
                ],
            )
            .map_err(map_err("insert lease"))?;
            Ok(())
        })
        .await
    }

    async fn read_by_resource(&self, resource_name: &str) -> StoreResult<Option<LeaseRecord>> {
        self.ready().await?;
        let key = resource_name.to_string();
        self.run(move |conn, scripts| read_one(conn, &scripts.select_by_resource(), &key))
            .await
    }

    async fn read_by_token(&self, token: &Token) -> StoreResult<Option<LeaseRecord>> {
        self.ready().await?;
        let key = token.as_str().to_string();
        self.run(move |conn, scripts| read_one(conn, &scripts.select_by_token(), &key))
            .await
    }

    async fn update(&self, record: &LeaseRecord) -> StoreResult<bool> {
        self.ready().await?;
        let record = record.clone();
        self.run(move |conn, scripts| {
            let changed = conn
                .execute(
                    &scripts.update(),
                    params![
                        to_storage_text(&record.expires_on),
                        record.lock_duration_ms,
                        record.token.as_str()
                    ],
                )
                .map_err(map_err("update lease"))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete_by_token(&self, token: &Token) -> StoreResult<()> {
        self.ready().await?;
        let key = token.as_str().to_string();
        self.run(move |conn, scripts| {
            conn.execute(&scripts.delete_by_token(), params![key])
                .map_err(map_err("delete lease"))?;
            Ok(())
        })
        .await
    }

    async fn delete_expired(&self, resource_name: &str, now: Timestamp) -> StoreResult<u64> {
        self.ready().await?;
        let key = resource_name.to_string();
        self.run(move |conn, scripts| {
            let removed = conn
                .execute(&scripts.delete_expired(), params![key, to_storage_text(&now)])
                .map_err(map_err("delete expired lease"))?;
            Ok(removed as u64)
        })
        .await
    }

    fn is_unique_key_violation(&self, err: &StoreError) -> bool {
        matches!(
            err.backend_source::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    }

    async fn ensure_table_exists(&self) -> StoreResult<()> {
        self.run(|conn, scripts| {
            conn.execute_batch(&scripts.create_table())
                .map_err(map_err("create lease table"))?;
            debug!(table = scripts.table(), "sqlite lease table ready");
            Ok(())
        })
        .await?;
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn table_exists(&self) -> StoreResult<bool> {
        self.run(|conn, scripts| {
            let count: i64 = conn
                .query_row(scripts.table_exists(), params![scripts.table()], |row| row.get(0))
                .map_err(map_err("look up lease table"))?;
            Ok(count > 0)
        })
        .await
    }

    async fn drop_table(&self) -> StoreResult<()> {
        self.schema_ready.store(false, Ordering::Release);
        self.run(|conn, scripts| {
            conn.execute_batch(&scripts.drop_table())
                .map_err(map_err("drop lease table"))?;
            Ok(())
        })
        .await
    }
}
