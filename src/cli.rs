use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "proclock", version, about, long_about = None)]
pub struct Cli {
    /// Lock configuration file (TOML). Defaults to a SQLite database in the
    /// current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Tries to take a lease; prints the token if granted
    Create {
        name: String,
        #[arg(long, default_value_t = 30_000)]
        duration_ms: i64,
    },
    /// Extends a lease if it is close enough to expiring
    Renew {
        token: String,
        /// 0 reuses the duration the lease was taken with
        #[arg(long, default_value_t = 0)]
        duration_ms: i64,
        #[arg(long, default_value_t = 5000)]
        min_renew_ms: i64,
    },
    /// Releases a lease; succeeds even if it is already gone
    Release { token: String },
    /// Reports whether a resource currently has a live lease
    Exists { name: String },
    /// Holds a renewing lease for a while, then releases it
    Hold {
        name: String,
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
}
