//! Named, lease-based mutual exclusion over a shared store.
//!
//! Processes coordinate through a table of lease rows keyed by resource name.
//! A lease is valid until its expiry, so a crashed holder never blocks a
//! resource for longer than one lease duration. Live holders renew, either by
//! calling [`LockManager::renew`] themselves or by holding a [`LockScope`].
//!
//! ```no_run
//! use lease::{InMemoryLeaseStore, LockManager};
//! use std::sync::Arc;
//!
//! # async fn run() -> lease::Result<()> {
//! let manager = LockManager::new(Arc::new(InMemoryLeaseStore::new()));
//! if let Some(token) = manager.create("nightly-report", 30_000).await? {
//!     // exclusive work
//!     manager.release(&token).await?;
//! }
//!
//! let mut scope = manager.begin_scope("reindex").await?;
//! if scope.is_locked() {
//!     // renewed in the background until stopped
//! }
//! scope.stop().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod error;
pub mod manager;
pub mod record;
pub mod scope;
pub mod store;
pub mod time;

pub mod test_utils;

pub use error::{Error, Result, StoreError};
pub use manager::{LockManager, DEFAULT_MIN_RENEW_INTERVAL_MS, REUSE_STORED_DURATION};
pub use record::{LeaseRecord, Token};
pub use scope::{LockScope, ScopeOptions, ScopeState};
pub use store::{InMemoryLeaseStore, LeaseStore, StoreResult};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
