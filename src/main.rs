use clap::{Parser, Subcommand};
use tracing::info;

mod backfill;
mod chat;
mod config;
mod ddp;
mod document;
mod entity;
mod index;
mod proxy;
mod rest;
mod sync;
mod writer;

/// Keeps an OpenSearch index in step with a RocketChat server.
#[derive(Parser)]
#[command(name = "rocketsync", version, about)]
struct Cli {
    #[command(flatten)]
    config: config::Config,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Stream new messages into the index (default).
    Sync,

    /// Index recent history of every channel once, then exit.
    Backfill {
        /// Messages fetched per channel.
        #[arg(
            long,
            env = "BACKFILL_PAGE_SIZE",
            default_value_t = 500,
            value_parser = clap::value_parser!(u32).range(1..)
        )]
        page_size: u32,
    },

    /// Serve the RocketChat-compatible search API and agent tools.
    Serve {
        /// Listening port.
        #[arg(long, env = "PORT", default_value_t = 3005)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.command.unwrap_or(Command::Sync) {
        Command::Sync => {
            info!("rocketsync {} starting real-time sync", env!("CARGO_PKG_VERSION"));
            sync::run(&config).await?;
        }
        Command::Backfill { page_size } => {
            info!("Backfilling up to {} messages per channel", page_size);
            let report = backfill::run(&config, page_size).await?;
            println!("Backfill complete: {}", report);
        }
        Command::Serve { port } => {
            proxy::serve(&config, port).await?;
        }
    }

    Ok(())
}
