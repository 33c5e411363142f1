use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lease::{LockManager, Token};
use serde_json::json;
use storage::{LockConfig, LockManagerBuilder};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;
use cli::{Cli, Commands};

const DEFAULT_DB: &str = "proclock.db";

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<LockConfig> {
    match &cli.config {
        Some(path) => LockConfig::from_file(path)
            .with_context(|| format!("loading lock config from {}", path.display())),
        None => Ok(LockConfig::sqlite(DEFAULT_DB)),
    }
}

async fn hold(manager: &LockManager, name: &str, seconds: u64) -> Result<()> {
    let mut scope = manager.begin_scope(name).await?;
    if !scope.is_locked() {
        bail!("{name} is held by another process");
    }
    info!(resource = name, seconds, "holding lease");

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let state = scope.state();
    scope.stop().await?;
    println!("{}", json!({ "resource": name, "final_state": format!("{state:?}") }));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let config = load_config(&cli)?;
    let manager = LockManagerBuilder::new(config).build().await?;

    match cli.command {
        Commands::Create { name, duration_ms } => {
            let token = manager.create(&name, duration_ms).await?;
            println!("{}", json!({ "resource": name, "token": token }));
            if token.is_none() {
                std::process::exit(1);
            }
        }
        Commands::Renew {
            token,
            duration_ms,
            min_renew_ms,
        } => {
            let renewed = manager
                .renew(&Token::from(token), duration_ms, min_renew_ms)
                .await?;
            println!("{}", json!({ "renewed": renewed }));
        }
        Commands::Release { token } => {
            manager.release(&Token::from(token)).await?;
        }
        Commands::Exists { name } => {
            let exists = manager.exists(&name).await?;
            println!("{}", json!({ "resource": name, "exists": exists }));
            if !exists {
                std::process::exit(1);
            }
        }
        Commands::Hold { name, seconds } => hold(&manager, &name, seconds).await?,
    }

    Ok(())
}
