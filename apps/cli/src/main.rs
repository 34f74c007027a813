//! Waterwall CLI
//!
//! Runs a single mux or reverse tunnel described by a node file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use waterwall_core::ApiResult;
use waterwall_logging::LogLevel;
use waterwall_runtime::{build_tunnel, Driver};
use waterwall_settings::Settings;

/// Waterwall - stream multiplexing and reverse tunnels
#[derive(Parser)]
#[command(name = "waterwall")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel until interrupted
    Run {
        /// Node file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Validate a node file and build its tunnel without binding sockets
    Check {
        /// Node file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load(path: &Path) -> Result<Settings> {
    Settings::load_from(path).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let settings = load(&config)?;
            let level = if cli.verbose { LogLevel::Debug } else { settings.log.level };
            waterwall_logging::init(level);
            run(&settings).await?;
        }
        Commands::Check { config } => {
            waterwall_logging::init(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn });
            check(&config)?;
        }
    }

    Ok(())
}

async fn run(settings: &Settings) -> Result<()> {
    let driver = Driver::from_settings(settings).context("building tunnel")?;
    let running = driver.start().await.context("starting driver")?;

    info!("{} started. Press Ctrl+C to stop.", settings.node.kind);

    // Wait for shutdown
    tokio::signal::ctrl_c().await?;
    if let Some(ApiResult::Ok(status)) = running.api(b"status").await {
        info!("{}", status);
    }
    running.shutdown().await;

    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let settings = load(path)?;
    let mut tunnel = build_tunnel(&settings).context("building tunnel")?;

    println!("{}", serde_json::to_string_pretty(&settings)?);
    match tunnel.api(b"status") {
        ApiResult::Ok(status) => println!("{}", status),
        ApiResult::Error(e) => println!("status unavailable: {}", e),
    }
    println!("prev: {}", settings.prev);
    println!("next: {}", settings.next);
    Ok(())
}
