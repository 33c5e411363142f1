//! Relational backends for the `lease` crate, plus the configuration and
//! builder that pick one.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod builder;
pub mod config;
pub mod scripts;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use builder::LockManagerBuilder;
pub use config::{BackendConfig, LockConfig};
pub use scripts::{Dialect, Scripts, DEFAULT_TABLE_NAME};

#[cfg(feature = "postgres")]
pub use postgres::PgLeaseStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLeaseStore;
