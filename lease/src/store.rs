use crate::{
    error::StoreError,
    record::{LeaseRecord, Token},
    time::Timestamp,
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicBool, Ordering};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence contract for lease rows.
///
/// The primary key on `resource_name` is the only atomicity the lock manager
/// relies on: `insert` must fail with an error for which
/// [`LeaseStore::is_unique_key_violation`] returns true when a row for the
/// same resource already exists.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    async fn insert(&self, record: &LeaseRecord) -> StoreResult<()>;

    async fn read_by_resource(&self, resource_name: &str) -> StoreResult<Option<LeaseRecord>>;

    async fn read_by_token(&self, token: &Token) -> StoreResult<Option<LeaseRecord>>;

    /// Writes `expires_on` and `lock_duration_ms` to the row holding
    /// `record.token`. Returns false if no such row exists.
    async fn update(&self, record: &LeaseRecord) -> StoreResult<bool>;

    /// No-op if absent.
    async fn delete_by_token(&self, token: &Token) -> StoreResult<()>;

    /// Deletes the row for `resource_name` only if it expired before `now`.
    /// Returns the number of rows removed.
    async fn delete_expired(&self, resource_name: &str, now: Timestamp) -> StoreResult<u64>;

    fn is_unique_key_violation(&self, err: &StoreError) -> bool;

    async fn ensure_table_exists(&self) -> StoreResult<()>;

    async fn table_exists(&self) -> StoreResult<bool>;

    async fn drop_table(&self) -> StoreResult<()>;
}

/// Process-local store. Useful for tests and for coordinating tasks inside a
/// single process; offers no durability.
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    records: DashMap<String, LeaseRecord>,
    unavailable: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// While set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn insert(&self, record: &LeaseRecord) -> StoreResult<()> {
        self.check_available()?;
        match self.records.entry(record.resource_name.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey {
                resource_name: record.resource_name.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn read_by_resource(&self, resource_name: &str) -> StoreResult<Option<LeaseRecord>> {
        self.check_available()?;
        Ok(self.records.get(resource_name).map(|entry| entry.clone()))
    }

    async fn read_by_token(&self, token: &Token) -> StoreResult<Option<LeaseRecord>> {
        self.check_available()?;
        Ok(self
            .records
            .iter()
            .find(|entry| entry.token == *token)
            .map(|entry| entry.value().clone()))
    }

    async fn update(&self, record: &LeaseRecord) -> StoreResult<bool> {
        self.check_available()?;
        for mut entry in self.records.iter_mut() {
            if entry.token == record.token {
                entry.expires_on = record.expires_on;
                entry.lock_duration_ms = record.lock_duration_ms;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_by_token(&self, token: &Token) -> StoreResult<()> {
        self.check_available()?;
        self.records.retain(|_, record| record.token != *token);
        Ok(())
    }

    async fn delete_expired(&self, resource_name: &str, now: Timestamp) -> StoreResult<u64> {
        self.check_available()?;
        let removed = self
            .records
            .remove_if(resource_name, |_, record| record.is_expired(now));
        Ok(u64::from(removed.is_some()))
    }

    fn is_unique_key_violation(&self, err: &StoreError) -> bool {
        matches!(err, StoreError::DuplicateKey { .. })
    }

    async fn ensure_table_exists(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn table_exists(&self) -> StoreResult<bool> {
        self.check_available()?;
        Ok(true)
    }

    async fn drop_table(&self) -> StoreResult<()> {
        self.check_available()?;
        self.records.clear();
        Ok(())
    }
}
