//! CLI entry point for the market cap rankings tool.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info};

mod app_config;
mod cli;
mod commands;

use app_config::{Settings, load_config};
use cli::{Args, CheckpointAction, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = load_config(args.config.as_deref())?;
    match (&loaded.config, &loaded.path) {
        (Some(_), Some(path)) => info!(path = %path.display(), "config loaded"),
        (None, Some(path)) => debug!(path = %path.display(), "no config file; using defaults"),
        _ => debug!("no config path resolved; using defaults"),
    }
    let settings = Settings::resolve(
        &args.overrides,
        Settings::env_api_key(),
        loaded.config.as_ref(),
    );

    match args.command {
        Command::Run(collect) => commands::run_pipeline_command(&settings, &collect).await,
        Command::Collect(collect) => commands::run_collect_command(&settings, &collect)
            .await
            .map(|_| ()),
        Command::Build { raw, format } => {
            commands::run_build_command(&settings, &raw, format.into()).await
        }
        Command::Validate { artifact, format } => {
            commands::run_validate_command(&settings, &artifact, format.map(Into::into)).await
        }
        Command::Schema { format } => commands::run_schema_command(format),
        Command::Checkpoints { action } => match action {
            CheckpointAction::List => commands::run_checkpoints_list_command(&settings),
            CheckpointAction::Delete { date } => {
                commands::run_checkpoints_delete_command(&settings, date)
            }
        },
    }
}
