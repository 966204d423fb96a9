use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "attacklens",
    version,
    about = "Analyze documents against the MITRE ATT&CK catalog"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP analysis service
    Serve(ServeArgs),
    /// Analyze a local document and print the report as JSON
    Analyze(AnalyzeArgs),
    /// Refresh the MITRE catalog cache
    RefreshCatalog(RefreshCatalogArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Directory containing attacklens.toml (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Override the listener address from the config
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Document file to analyze
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Directory containing attacklens.toml (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Use a local STIX bundle instead of the network or cache
    #[arg(long, value_name = "FILE")]
    pub catalog_file: Option<PathBuf>,

    /// Minimum confidence required to keep a match (0-100)
    #[arg(long, value_name = "SCORE")]
    pub min_confidence: Option<u8>,
}

#[derive(Args)]
pub struct RefreshCatalogArgs {
    /// Directory containing attacklens.toml (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Refresh even when the cached copy is still fresh
    #[arg(long)]
    pub force: bool,
}
