use crate::{
    error::{Error, Result},
    record::{LeaseRecord, Token},
    scope::{LockScope, ScopeOptions},
    store::LeaseStore,
    time::{expires_after, Clock, SystemClock},
};
use std::sync::Arc;
use tracing::{debug, info};

/// Debounce window applied by [`LockManager::renew_default`].
pub const DEFAULT_MIN_RENEW_INTERVAL_MS: i64 = 5000;

/// Passed as `lock_duration_ms` to renew with the duration stored on the row.
pub const REUSE_STORED_DURATION: i64 = 0;

/// Creates, renews and releases leases against a shared [`LeaseStore`].
///
/// Cloning is cheap; clones share the store and clock.
#[derive(Debug, Clone)]
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    scope_options: ScopeOptions,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            scope_options: ScopeOptions::default(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the policy used by [`LockManager::begin_scope`].
    pub fn with_scope_options(mut self, options: ScopeOptions) -> Result<Self> {
        options.validate()?;
        self.scope_options = options;
        Ok(self)
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn scope_options(&self) -> &ScopeOptions {
        &self.scope_options
    }

    /// Attempts to take an exclusive lease on `resource_name`.
    ///
    /// Returns `Ok(None)` when another holder has a live lease, or won a race
    /// to insert. Store faults other than a unique-key violation are returned
    /// as errors. A duration whose expiry falls outside the calendar range is
    /// rejected as invalid.
    pub async fn create(&self, resource_name: &str, lock_duration_ms: i64) -> Result<Option<Token>> {
        if lock_duration_ms <= 0 || expires_after(self.clock.now(), lock_duration_ms).is_none() {
            return Err(Error::InvalidDuration {
                duration_ms: lock_duration_ms,
            });
        }
        if resource_name.is_empty() {
            return Err(Error::EmptyResourceName);
        }

        let now = self.clock.now();
        if let Some(existing) = self.store.read_by_resource(resource_name).await? {
            if !existing.is_expired(now) {
                debug!(resource = resource_name, expires_on = %existing.expires_on, "lease held, create denied");
                return Ok(None);
            }

            // Conditional on expiry: a concurrent taker that already replaced
            // the row keeps its lease and our insert below collides.
            let removed = self.store.delete_expired(resource_name, now).await?;
            info!(resource = resource_name, removed, "taking over expired lease");
        }

        self.insert(resource_name, lock_duration_ms).await
    }

    async fn insert(&self, resource_name: &str, lock_duration_ms: i64) -> Result<Option<Token>> {
        let record = LeaseRecord::acquire(resource_name, self.clock.now(), lock_duration_ms)?;
        match self.store.insert(&record).await {
            Ok(()) => {
                debug!(resource = resource_name, token = %record.token, lock_duration_ms, "lease created");
                Ok(Some(record.token))
            }
            Err(err) if self.store.is_unique_key_violation(&err) => {
                debug!(resource = resource_name, "lost insert race, create denied");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Extends the lease held under `token` if it is within
    /// `min_renew_interval_ms` of expiring.
    ///
    /// A non-positive `lock_duration_ms` reuses the duration stored on the
    /// row. Returns false when the window has not been reached yet, or when no
    /// row carries `token` any more.
    pub async fn renew(&self, token: &Token, lock_duration_ms: i64, min_renew_interval_ms: i64) -> Result<bool> {
        let Some(mut record) = self.store.read_by_token(token).await? else {
            debug!(%token, "nothing to renew");
            return Ok(false);
        };

        let now = self.clock.now();
        if !record.due_for_renewal(now, min_renew_interval_ms) {
            return Ok(false);
        }

        if lock_duration_ms > 0 {
            record.lock_duration_ms = lock_duration_ms;
        }
        record.expires_on = expires_after(now, record.lock_duration_ms).ok_or(Error::InvalidDuration {
            duration_ms: record.lock_duration_ms,
        })?;

        let updated = self.store.update(&record).await?;
        if updated {
            debug!(resource = %record.resource_name, %token, expires_on = %record.expires_on, "lease renewed");
        }
        Ok(updated)
    }

    /// [`LockManager::renew`] with the stored duration and the default
    /// debounce window.
    pub async fn renew_default(&self, token: &Token) -> Result<bool> {
        self.renew(token, REUSE_STORED_DURATION, DEFAULT_MIN_RENEW_INTERVAL_MS)
            .await
    }

    /// Deletes the lease held under `token`. Releasing an unknown or already
    /// released token succeeds without effect.
    pub async fn release(&self, token: &Token) -> Result<()> {
        self.store.delete_by_token(token).await?;
        debug!(%token, "lease released");
        Ok(())
    }

    /// Whether `resource_name` currently has a live lease. Point-in-time only.
    pub async fn exists(&self, resource_name: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .store
            .read_by_resource(resource_name)
            .await?
            .is_some_and(|record| record.is_valid(now)))
    }

    /// The row currently held under `token`, if any.
    pub async fn lookup(&self, token: &Token) -> Result<Option<LeaseRecord>> {
        Ok(self.store.read_by_token(token).await?)
    }

    /// Acquires `resource_name` and keeps it renewed until the returned scope
    /// is stopped or dropped. Check [`LockScope::is_locked`] to see whether
    /// the lease was granted.
    pub async fn begin_scope(&self, resource_name: &str) -> Result<LockScope> {
        LockScope::begin(self.clone(), resource_name, self.scope_options.clone()).await
    }

    pub async fn begin_scope_with(&self, resource_name: &str, options: ScopeOptions) -> Result<LockScope> {
        options.validate()?;
        LockScope::begin(self.clone(), resource_name, options).await
    }
}
