use attacklens::cli::{commands, Cli, Command};
use attacklens::core::config::{ConfigLoader, LoggingConfig};
use clap::Parser;
use std::path::PathBuf;

/// Best-effort logging configuration: the command's config directory when it
/// loads, defaults otherwise. Config errors resurface with full context once
/// the command itself loads it.
fn logging_config(config_dir: Option<&PathBuf>) -> LoggingConfig {
    let dir = config_dir
        .cloned()
        .or_else(|| std::env::current_dir().ok());
    dir.and_then(|dir| ConfigLoader::load_from_dir(&dir).ok())
        .map(|config| config.logging)
        .unwrap_or_default()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_dir = match &cli.command {
        Command::Serve(args) => args.config_dir.as_ref(),
        Command::Analyze(args) => args.config_dir.as_ref(),
        Command::RefreshCatalog(args) => args.config_dir.as_ref(),
    };
    let _guard = match attacklens::logging::init(&logging_config(config_dir)) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("warning: logging unavailable: {}", err);
            None
        }
    };

    let outcome = match cli.command {
        Command::Serve(args) => commands::run_serve(args).await,
        Command::Analyze(args) => commands::run_analyze(args).await,
        Command::RefreshCatalog(args) => commands::run_refresh_catalog(args).await,
    };

    if let Err(err) = outcome {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
