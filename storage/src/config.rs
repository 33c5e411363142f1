use crate::scripts::{with_random_suffix, DEFAULT_TABLE_NAME};
use lease::{Error, Result, ScopeOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Which store backs the lease table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Process-local; leases are not shared with other processes.
    Memory,
    /// `path` may be `:memory:` for a private database.
    Sqlite { path: PathBuf },
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    pub backend: BackendConfig,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Append a random suffix to `table_name`, giving this instance its own table.
    #[serde(default)]
    pub unique_table_suffix: bool,
    #[serde(default)]
    pub scope: ScopeOptions,
}

impl LockConfig {
    pub fn memory() -> Self {
        Self::with_backend(BackendConfig::Memory)
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::with_backend(BackendConfig::Sqlite { path: path.into() })
    }

    pub fn postgres(url: impl Into<String>) -> Self {
        Self::with_backend(BackendConfig::Postgres {
            url: url.into(),
            max_connections: default_max_connections(),
        })
    }

    fn with_backend(backend: BackendConfig) -> Self {
        Self {
            backend,
            table_name: default_table_name(),
            unique_table_suffix: false,
            scope: ScopeOptions::default(),
        }
    }

    #[must_use]
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    #[must_use]
    pub fn use_unique_table_suffix(mut self) -> Self {
        self.unique_table_suffix = true;
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: ScopeOptions) -> Self {
        self.scope = scope;
        self
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(Error::Config("table_name must not be empty".into()));
        }
        if let BackendConfig::Postgres { url, max_connections } = &self.backend {
            if url.is_empty() {
                return Err(Error::Config("postgres url must not be empty".into()));
            }
            if *max_connections == 0 {
                return Err(Error::Config("max_connections must be at least 1".into()));
            }
        }
        self.scope.validate()
    }

    /// The table this configuration addresses. With `unique_table_suffix`
    /// every call yields a different name.
    pub fn resolve_table_name(&self) -> String {
        if self.unique_table_suffix {
            with_random_suffix(&self.table_name)
        } else {
            self.table_name.clone()
        }
    }
}
