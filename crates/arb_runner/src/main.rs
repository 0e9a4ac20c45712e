use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use observability::init_tracing;

mod bootstrap;
mod config_loader;
mod control_api;

#[derive(Parser, Debug)]
#[command(name = "arbwatch", about = "Reactive arbitrage controller", version)]
struct Cli {
    /// Config file; falls back to ARBWATCH_CONFIG_PATH, then configs/arbwatch.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default).
    Run,
    /// Take the cross-process lock and hold it, for checking the watchdog.
    HoldLock(HoldLockArgs),
}

#[derive(Args, Debug, Clone)]
struct HoldLockArgs {
    #[arg(long, env = "ARBWATCH_LOCK_PATH", default_value = "arbwatch.lock")]
    path: PathBuf,
    #[arg(long, default_value_t = 3_600_000)]
    ceiling_ms: u64,
    #[arg(long, default_value_t = 10_000)]
    hold_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing("arb_runner");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let path = config_loader::config_path(cli.config);
            let cfg = config_loader::load_config(&path)?;
            tracing::info!(config = %path.display(), "config loaded");
            bootstrap::run(cfg).await
        }
        Commands::HoldLock(args) => {
            bootstrap::hold_lock(
                &args.path,
                Duration::from_millis(args.ceiling_ms),
                Duration::from_millis(args.hold_ms),
            )
            .await
        }
    }
}
