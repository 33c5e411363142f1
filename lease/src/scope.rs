use crate::{
    error::{Error, Result},
    manager::LockManager,
    record::Token,
    time::{expires_after, Timestamp},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

/// Renewal policy for a [`LockScope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeOptions {
    /// Duration requested on acquisition and on every renewal.
    pub lock_duration_ms: i64,
    /// Renew once the lease is this close to expiring.
    pub renew_threshold_ms: i64,
    /// How often the background task checks the tracked expiry.
    pub poll_interval_ms: u64,
    /// Consecutive store faults tolerated before the scope gives the lease up.
    pub max_renew_failures: u32,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self {
            lock_duration_ms: 30_000,
            renew_threshold_ms: 10_000,
            poll_interval_ms: 500,
            max_renew_failures: 3,
        }
    }
}

impl ScopeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.lock_duration_ms <= 0 {
            return Err(Error::InvalidDuration {
                duration_ms: self.lock_duration_ms,
            });
        }
        if self.renew_threshold_ms <= 0 || self.renew_threshold_ms >= self.lock_duration_ms {
            return Err(Error::InvalidScopeOptions(format!(
                "renew threshold {}ms must be positive and below the lock duration {}ms",
                self.renew_threshold_ms, self.lock_duration_ms
            )));
        }
        let poll_ms = i64::try_from(self.poll_interval_ms).unwrap_or(i64::MAX);
        if poll_ms == 0 || poll_ms >= self.renew_threshold_ms {
            return Err(Error::InvalidScopeOptions(format!(
                "poll interval {}ms must be positive and below the renew threshold {}ms",
                self.poll_interval_ms, self.renew_threshold_ms
            )));
        }
        if self.max_renew_failures == 0 {
            return Err(Error::InvalidScopeOptions(
                "max_renew_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Another holder had the lease; nothing runs.
    Denied,
    /// Lease granted and being renewed in the background.
    Held,
    /// Renewal stopped working; the lease may belong to someone else now.
    Lost,
    /// Stopped and released.
    Released,
}

/// Holds a lease for as long as it is alive.
///
/// A granted scope runs one background task that renews the lease ahead of
/// expiry. [`LockScope::stop`] ends the task and releases the lease before
/// returning. Dropping an unstopped scope signals the task and spawns the
/// release onto the current runtime; without a runtime the lease just expires.
#[derive(Debug)]
pub struct LockScope {
    resource_name: String,
    token: Option<Token>,
    manager: LockManager,
    state: Arc<Mutex<ScopeState>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LockScope {
    pub(crate) async fn begin(manager: LockManager, resource_name: &str, options: ScopeOptions) -> Result<Self> {
        let token = manager.create(resource_name, options.lock_duration_ms).await?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let (state, task) = match &token {
            Some(token) => {
                info!(resource = resource_name, %token, "scope acquired lease");
                let state = Arc::new(Mutex::new(ScopeState::Held));
                let renewer = Renewer {
                    manager: manager.clone(),
                    token: token.clone(),
                    options,
                    state: state.clone(),
                    acquired_at: manager.clock().now(),
                };
                (state, Some(tokio::spawn(renewer.run(stop_rx))))
            }
            None => {
                debug!(resource = resource_name, "scope denied");
                (Arc::new(Mutex::new(ScopeState::Denied)), None)
            }
        };

        Ok(Self {
            resource_name: resource_name.to_string(),
            token,
            manager,
            state,
            stop_tx,
            task,
        })
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn state(&self) -> ScopeState {
        *self.state.lock()
    }

    /// True while the lease is held and being renewed.
    pub fn is_locked(&self) -> bool {
        self.token.is_some() && self.state() == ScopeState::Held
    }

    /// Stops renewal, waits for the background task to exit, then releases.
    ///
    /// Idempotent. If the release itself fails the token is kept, so the
    /// call can be retried (and drop will try again).
    pub async fn stop(&mut self) -> Result<()> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };

        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(resource = %self.resource_name, error = %err, "renewal task ended abnormally");
            }
        }

        if let Err(err) = self.manager.release(&token).await {
            self.token = Some(token);
            return Err(err);
        }

        *self.state.lock() = ScopeState::Released;
        info!(resource = %self.resource_name, "scope released lease");
        Ok(())
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let _ = self.stop_tx.send(true);
        let task = self.task.take();
        let manager = self.manager.clone();
        let resource = std::mem::take(&mut self.resource_name);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(task) = task {
                        let _ = task.await;
                    }
                    if let Err(err) = manager.release(&token).await {
                        warn!(%resource, error = %err, "release on drop failed; lease will expire");
                    }
                });
            }
            Err(_) => {
                warn!(%resource, "scope dropped outside a runtime; lease will expire");
            }
        }
    }
}

struct Renewer {
    manager: LockManager,
    token: Token,
    options: ScopeOptions,
    state: Arc<Mutex<ScopeState>>,
    acquired_at: Timestamp,
}

impl Renewer {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut tracked_expiry =
            expires_after(self.acquired_at, self.options.lock_duration_ms).unwrap_or(self.acquired_at);
        let mut failures = 0u32;

        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => break,
                () = tokio::time::sleep(self.options.poll_interval()) => {}
            }

            let now = self.manager.clock().now();
            if expires_after(tracked_expiry, -self.options.renew_threshold_ms).is_some_and(|due| due >= now) {
                continue;
            }

            match self.renew_once(now).await {
                Ok(Some(expiry)) => {
                    failures = 0;
                    tracked_expiry = expiry;
                }
                Ok(None) => {
                    warn!(token = %self.token, "lease no longer held, stopping renewal");
                    self.mark_lost();
                    break;
                }
                Err(err) => {
                    failures += 1;
                    warn!(token = %self.token, failures, error = %err, "lease renewal failed");
                    if failures >= self.options.max_renew_failures {
                        self.mark_lost();
                        break;
                    }
                }
            }
        }
    }

    /// The new expiry estimate, or `None` if the lease is gone.
    async fn renew_once(&self, now: Timestamp) -> Result<Option<Timestamp>> {
        let renewed = self
            .manager
            .renew(&self.token, self.options.lock_duration_ms, self.options.renew_threshold_ms)
            .await?;
        if renewed {
            return Ok(Some(expires_after(now, self.options.lock_duration_ms).unwrap_or(now)));
        }
        // Debounced against the stored expiry, or the row is gone.
        Ok(self
            .manager
            .lookup(&self.token)
            .await?
            .map(|record| record.expires_on))
    }

    fn mark_lost(&self) {
        let mut state = self.state.lock();
        if *state == ScopeState::Held {
            *state = ScopeState::Lost;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::InMemoryLeaseStore, time::ManualClock};

    fn fast_options() -> ScopeOptions {
        ScopeOptions {
            lock_duration_ms: 1000,
            renew_threshold_ms: 300,
            poll_interval_ms: 10,
            max_renew_failures: 2,
        }
    }

    fn manager() -> (LockManager, Arc<ManualClock>, Arc<InMemoryLeaseStore>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(InMemoryLeaseStore::new());
        let manager = LockManager::new(store.clone())
            .with_clock(clock.clone())
            .with_scope_options(fast_options())
            .unwrap();
        (manager, clock, store)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[test]
    fn test_default_options_are_valid() {
        ScopeOptions::default().validate().unwrap();
    }

    #[test]
    fn test_threshold_above_duration_is_rejected() {
        let options = ScopeOptions {
            lock_duration_ms: 30_000,
            renew_threshold_ms: 50_000,
            ..ScopeOptions::default()
        };
        assert!(matches!(options.validate(), Err(Error::InvalidScopeOptions(_))));

        let options = ScopeOptions {
            poll_interval_ms: 20_000,
            ..ScopeOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[tokio::test]
    async fn test_scope_holds_and_releases() {
        let (manager, _, _) = manager();
        assert!(!manager.exists("job-C").await.unwrap());

        let mut scope = manager.begin_scope("job-C").await.unwrap();
        assert!(scope.is_locked());
        assert!(scope.token().is_some());
        assert!(manager.exists("job-C").await.unwrap());

        scope.stop().await.unwrap();
        assert_eq!(scope.state(), ScopeState::Released);
        assert!(scope.token().is_none());
        assert!(!manager.exists("job-C").await.unwrap());

        // second stop is a no-op
        scope.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_denied_when_held() {
        let (manager, _, _) = manager();
        let token = manager.create("job", 10_000).await.unwrap().unwrap();

        let mut scope = manager.begin_scope("job").await.unwrap();
        assert_eq!(scope.state(), ScopeState::Denied);
        assert!(!scope.is_locked());
        assert!(scope.token().is_none());

        scope.stop().await.unwrap();
        assert_eq!(manager.lookup(&token).await.unwrap().unwrap().token, token);
    }

    #[tokio::test]
    async fn test_scope_renews_ahead_of_expiry() {
        let (manager, clock, _) = manager();
        let mut scope = manager.begin_scope("job").await.unwrap();
        let token = scope.token().cloned().unwrap();
        let original = manager.lookup(&token).await.unwrap().unwrap().expires_on;

        clock.advance_ms(800);
        settle().await;

        let renewed = manager.lookup(&token).await.unwrap().unwrap().expires_on;
        assert!(renewed > original);
        assert!(scope.is_locked());

        // well past the original expiry the lease is still live
        clock.advance_ms(500);
        assert!(manager.exists("job").await.unwrap());

        scope.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_lost_after_takeover() {
        let (manager, clock, _) = manager();
        let scope = manager.begin_scope("job").await.unwrap();
        let token = scope.token().cloned().unwrap();

        // the lease lapses and another holder takes it over before the next tick
        clock.advance_ms(1001);
        let usurper = manager.create("job", 10_000).await.unwrap().unwrap();
        assert_ne!(usurper, token);
        settle().await;

        assert_eq!(scope.state(), ScopeState::Lost);
        assert!(!scope.is_locked());
        assert_eq!(manager.lookup(&usurper).await.unwrap().unwrap().token, usurper);
    }

    #[tokio::test]
    async fn test_scope_lost_after_repeated_faults() {
        let (manager, clock, store) = manager();
        let scope = manager.begin_scope("job").await.unwrap();

        store.set_unavailable(true);
        clock.advance_ms(800);
        settle().await;

        assert_eq!(scope.state(), ScopeState::Lost);
        store.set_unavailable(false);
    }

    #[tokio::test]
    async fn test_drop_releases_lease() {
        let (manager, _, store) = manager();
        let scope = manager.begin_scope("job").await.unwrap();
        assert_eq!(store.len(), 1);

        drop(scope);
        settle().await;

        assert!(store.is_empty());
        assert!(!manager.exists("job").await.unwrap());
    }
}
