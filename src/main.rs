//! Gantry - get step execution core
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use gantry::cli::{Cli, Commands};
use gantry::config::ConfigManager;
use gantry::error::GantryResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, log_format: &str) {
    // 0 = warn, 1 = info, 2+ = debug
    let filter = match verbose {
        0 => EnvFilter::new("gantry=warn"),
        1 => EnvFilter::new("gantry=info"),
        _ => EnvFilter::new("gantry=debug"),
    };

    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }
}

async fn run() -> GantryResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config.general.log_format);
    debug!("Loaded config from {}", config_manager.path().display());

    // Ensure state directories exist
    ConfigManager::ensure_state_dirs(&config).await?;

    match cli.command {
        Commands::Get(args) => gantry::cli::commands::get(args, &config).await,
        Commands::Cache(args) => gantry::cli::commands::cache(args, &config).await,
        Commands::Config(args) => {
            gantry::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
