//! lnchat
//!
//! Runs a messaging node on top of an LND node: messages travel as custom
//! records on keysend or invoice payments.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod password;
mod ui;

#[derive(Parser)]
#[command(name = "lnchat")]
#[command(about = "lnchat - messages over Lightning payments", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and stream messages until Ctrl-C
    Run(commands::run::RunArgs),

    /// Hash a password for server.pwdhash
    Genpwdhash,
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub(crate) fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::run(args).await?,
        Commands::Genpwdhash => commands::genpwdhash::run()?,
    }

    Ok(())
}
