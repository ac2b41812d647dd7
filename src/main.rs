mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;
use workspace_host::{Error as HostError, HostConfig, Parser as ConfigParser};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(host_error) = e.downcast_ref::<HostError>() {
            eprintln!("Error: {}", host_error);
            if let Some(suggestion) = host_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Validation reports load failures itself
    if let Commands::Validate = cli.command {
        return commands::run_validate(cli.config.as_deref());
    }

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve => commands::run_serve(config).await?,
        Commands::Status { workspace, json } => {
            commands::run_status(&config, workspace.as_deref(), json).await?
        }
        Commands::History { workspace, json } => {
            commands::run_history(&config, &workspace, json).await?
        }
        Commands::Prune { json } => commands::run_prune(config, json).await?,
        Commands::Validate => unreachable!("handled before config loading"),
    }

    Ok(())
}

/// Load the config file if one is found, otherwise run on defaults.
fn load_config(cli: &Cli) -> anyhow::Result<HostConfig> {
    let parser = ConfigParser::new();
    match parser.find_config_file(cli.config.as_deref())? {
        Some(path) => {
            tracing::debug!("Loading config from {}", path.display());
            Ok(parser.load_config(&path)?)
        }
        None => {
            tracing::debug!("No config file found, using defaults");
            let config = HostConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Logs go to stderr; stdout carries the control protocol under `serve`.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}
