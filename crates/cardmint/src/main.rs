//! CardMint scanning station.
//!
//! Usage:
//!     cardmint run --config cardmint.toml
//!     cardmint migrate
//!     cardmint drain --timeout-secs 30

mod app;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "cardmint", about = "High-throughput trading card scanning pipeline")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Mirror the full log filter to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the watcher and worker pool.
    Run,
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Signal the running process to drain and wait for it, bounded.
    Drain {
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match app::load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cardmint: invalid configuration: {e:#}");
            return ExitCode::from(2);
        }
    };

    let result = match args.command {
        Command::Run => app::run(config, args.verbose).await,
        Command::Migrate => app::migrate(config).await,
        Command::Drain { timeout_secs } => app::request_drain(timeout_secs).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cardmint: {e:#}");
            ExitCode::from(1)
        }
    }
}
