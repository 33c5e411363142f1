use crate::{
    manager::LockManager,
    record::Token,
    scope::ScopeOptions,
    store::{InMemoryLeaseStore, LeaseStore},
    time::ManualClock,
    Result,
};
use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

/// A resource name no other test will pick.
pub fn unique_resource_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Scope policy fast enough for tests: 1s leases, renewed 300ms ahead,
/// checked every 10ms.
pub fn fast_scope_options() -> ScopeOptions {
    ScopeOptions {
        lock_duration_ms: 1000,
        renew_threshold_ms: 300,
        poll_interval_ms: 10,
        max_renew_failures: 2,
    }
}

/// A manager on a fresh in-memory store and the wall clock.
pub fn memory_manager() -> (LockManager, Arc<InMemoryLeaseStore>) {
    let store = Arc::new(InMemoryLeaseStore::new());
    (LockManager::new(store.clone()), store)
}

/// A manager on a fresh in-memory store whose clock only moves on demand.
pub fn manual_manager() -> (LockManager, Arc<ManualClock>, Arc<InMemoryLeaseStore>) {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(InMemoryLeaseStore::new());
    let manager = LockManager::new(store.clone()).with_clock(clock.clone());
    (manager, clock, store)
}

/// Independent managers sharing one store, standing in for separate processes.
pub fn contenders(store: Arc<dyn LeaseStore>, count: usize) -> Vec<LockManager> {
    (0..count).map(|_| LockManager::new(store.clone())).collect()
}

/// Runs `create` on every manager concurrently and returns the tokens granted.
pub async fn race_create(managers: &[LockManager], resource_name: &str, lock_duration_ms: i64) -> Result<Vec<Token>> {
    let attempts = managers
        .iter()
        .map(|manager| manager.create(resource_name, lock_duration_ms));
    let mut granted = Vec::new();
    for outcome in join_all(attempts).await {
        if let Some(token) = outcome? {
            granted.push(token);
        }
    }
    Ok(granted)
}

#[derive(Debug)]
pub struct LatencyMeasurement {
    pub operation: String,
    pub start_time: std::time::Instant,
    pub elapsed: std::time::Duration,
}

impl LatencyMeasurement {
    pub fn start(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start_time: std::time::Instant::now(),
            elapsed: std::time::Duration::ZERO,
        }
    }

    pub fn stop(&mut self) {
        self.elapsed = self.start_time.elapsed();
    }

    pub fn assert_milliseconds(&self, max_ms: u64) {
        let ms = self.elapsed.as_millis();
        assert!(
            ms <= u128::from(max_ms),
            "{} took {}ms, expected <= {}ms",
            self.operation,
            ms,
            max_ms
        );
    }
}
