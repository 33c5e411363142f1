use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid lock duration: {duration_ms}ms (must be greater than 0)")]
    InvalidDuration { duration_ms: i64 },

    #[error("Resource name must not be empty")]
    EmptyResourceName,

    #[error("Invalid scope options: {0}")]
    InvalidScopeOptions(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Faults raised by a [`crate::store::LeaseStore`] backend.
///
/// Backends wrap their driver errors in [`StoreError::Backend`] and answer
/// `is_unique_key_violation` by inspecting their own error type, never the
/// rendered message.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate key: {resource_name:?}")]
    DuplicateKey { resource_name: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt lease row: {0}")]
    Corrupt(String),

    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn backend<E>(context: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            context,
            source: Box::new(source),
        }
    }

    /// Downcasts the wrapped driver error, if this is a backend fault.
    pub fn backend_source<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Backend { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
