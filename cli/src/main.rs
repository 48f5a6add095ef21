//! `tether` command-line tool.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tether_cli::{Command, Workspace};
use tether_sync::SyncConfig;
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Inspect and repair a Tether offline sync store")]
struct Args {
    /// Path to the SQLite store
    #[arg(short, long, default_value = "tether.db")]
    db: PathBuf,

    /// JSON sync config (namespace, retry policy, ...)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage namespace, overriding the config
    #[arg(short, long)]
    namespace: Option<String>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            SyncConfig::from_json(&raw).context("invalid sync config")?
        }
        None => SyncConfig::default(),
    };
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    debug!("Using namespace {} in {}", config.namespace, args.db.display());

    let workspace = Workspace::open(&args.db, &config)?;
    let output = workspace.execute(&args.command, args.json).await?;
    println!("{output}");
    Ok(())
}
