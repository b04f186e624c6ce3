//! # Command Line Interface
//!
//! Entry points for the `dbsecrets` binary: run the service, validate
//! configuration, or run a single rotation pass.

use crate::config::AppConfig;
use crate::observability::{init_observability, logging::log_config_info};
use crate::{DbSecrets, APP_NAME, VERSION};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dbsecrets")]
#[command(about = "Database credential issuance and static account rotation")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short, long, env = "DBSECRETS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Storage URL override
    #[arg(long)]
    pub storage_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the rotation scheduler and invalidation listener until ctrl-c
    Serve,

    /// Load and validate configuration, then exit
    CheckConfig,

    /// Run one rotation pass over every static account and exit
    RotateOnce,
}

/// Parse arguments and run the selected command
pub async fn run_cli() -> anyhow::Result<()> {
    run(Cli::parse()).await
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(url) = cli.storage_url {
        config.storage.url = url;
        config.validate().context("invalid storage URL override")?;
    }
    if cli.verbose {
        config.observability.log_level = "debug".to_string();
    }

    let command = cli.command.unwrap_or(Commands::Serve);
    if let Commands::CheckConfig = command {
        println!("Configuration is valid");
        println!("  storage:            {}", config.storage.url);
        println!("  rotation enabled:   {}", config.rotation.enabled);
        println!("  rotation interval:  {}s", config.rotation.interval_seconds);
        println!("  password policies:  {}", config.password_policies.len());
        return Ok(());
    }

    let metrics = init_observability(&config.observability)
        .await
        .context("failed to initialise observability")?;
    info!(app_name = APP_NAME, version = VERSION, "Starting dbsecrets");
    log_config_info(&config);

    let app = DbSecrets::open(config, metrics).await.context("failed to open storage")?;

    match command {
        Commands::RotateOnce => {
            let summary = app.engine.run_pass().await.context("rotation pass failed")?;
            println!(
                "evaluated={} due={} rotated={} failed={} suppressed={}",
                summary.evaluated, summary.due, summary.rotated, summary.failed, summary.suppressed
            );
            app.manager.evict_all().await;
        }
        Commands::Serve => serve(app).await?,
        Commands::CheckConfig => {}
    }

    Ok(())
}

async fn serve(app: DbSecrets) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let tasks = app.start_background(shutdown.clone());

    signal::ctrl_c().await.context("failed to install ctrl-c handler")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    app.shutdown(tasks).await;
    info!("dbsecrets stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["dbsecrets", "--config", "dbsecrets.toml", "rotate-once"]);
        assert_eq!(cli.config, Some(PathBuf::from("dbsecrets.toml")));
        assert!(matches!(cli.command, Some(Commands::RotateOnce)));

        let cli = Cli::parse_from(["dbsecrets", "--storage-url", "memory://"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.storage_url.as_deref(), Some("memory://"));
    }
}
