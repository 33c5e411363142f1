use lease::{Error, Result};
use rand::{distributions::Alphanumeric, Rng};

pub const DEFAULT_TABLE_NAME: &str = "ProcessLock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

fn is_valid_ident(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// `name` followed by `_` and eight random alphanumerics, so parallel runs
/// can each own a table.
pub fn with_random_suffix(name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{name}_{suffix}")
}

/// Statement text for one lease table in one dialect.
#[derive(Debug, Clone)]
pub struct Scripts {
    dialect: Dialect,
    table: String,
}

impl Scripts {
    pub fn new(dialect: Dialect, table: &str) -> Result<Self> {
        if !is_valid_ident(table) {
            return Err(Error::Config(format!("invalid lease table name {table:?}")));
        }
        Ok(Self {
            dialect,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn create_table(&self) -> String {
        match self.dialect {
            Dialect::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    ResourceName TEXT PRIMARY KEY NOT NULL,
                    Token TEXT NOT NULL,
                    ExpiresOn TEXT NOT NULL,
                    LockDuration INTEGER NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS IX_{t}_Token ON {t} (Token);",
                t = self.table
            ),
            Dialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    ResourceName VARCHAR(200) PRIMARY KEY,
                    Token VARCHAR(64) NOT NULL,
                    ExpiresOn TIMESTAMPTZ NOT NULL,
                    LockDuration BIGINT NOT NULL
                )",
                t = self.table
            ),
        }
    }

    /// Postgres runs one statement per query; the token index is separate.
    pub fn create_token_index(&self) -> String {
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS IX_{t}_Token ON {t} (Token)",
            t = self.table
        )
    }

    pub fn table_exists(&self) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => "SELECT COUNT(name) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            Dialect::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1"
            }
        }
    }

    pub fn drop_table(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.table)
    }

    pub fn insert(&self) -> String {
        let (a, b, c, d) = self.placeholders();
        format!(
            "INSERT INTO {} (ResourceName, Token, ExpiresOn, LockDuration) VALUES ({a}, {b}, {c}, {d})",
            self.table
        )
    }

    pub fn select_by_resource(&self) -> String {
        format!(
            "SELECT ResourceName, Token, ExpiresOn, LockDuration FROM {} WHERE ResourceName = {}",
            self.table,
            self.placeholders().0
        )
    }

    pub fn select_by_token(&self) -> String {
        format!(
            "SELECT ResourceName, Token, ExpiresOn, LockDuration FROM {} WHERE Token = {}",
            self.table,
            self.placeholders().0
        )
    }

    pub fn update(&self) -> String {
        let (a, b, c, _) = self.placeholders();
        format!(
            "UPDATE {} SET ExpiresOn = {a}, LockDuration = {b} WHERE Token = {c}",
            self.table
        )
    }

    pub fn delete_by_token(&self) -> String {
        format!(
            "DELETE FROM {} WHERE Token = {}",
            self.table,
            self.placeholders().0
        )
    }

    /// SQLite stores `ExpiresOn` as text; comparing through `julianday` keeps
    /// rows written without the `T`/`Z` form ordered by time.
    pub fn delete_expired(&self) -> String {
        let (a, b, _, _) = self.placeholders();
        match self.dialect {
            Dialect::Sqlite => format!(
                "DELETE FROM {} WHERE ResourceName = {a} AND julianday(ExpiresOn) < julianday({b})",
                self.table
            ),
            Dialect::Postgres => format!(
                "DELETE FROM {} WHERE ResourceName = {a} AND ExpiresOn < {b}",
                self.table
            ),
        }
    }

    fn placeholders(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self.dialect {
            Dialect::Sqlite => ("?1", "?2", "?3", "?4"),
            Dialect::Postgres => ("$1", "$2", "$3", "$4"),
        }
    }
}
