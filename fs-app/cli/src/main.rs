//! sparseimg Command Line Interface
//!
//! Inspects, exports and verifies bitmap-described volume images.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// sparseimg - read the occupied blocks of captured volume images
#[derive(Parser)]
#[command(
    name = "sparseimg",
    about = "Read the occupied blocks of sparse volume images",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show geometry and used space
    Info(commands::info::InfoArgs),

    /// Copy occupied blocks to a sparse output file
    Export(commands::export::ExportArgs),

    /// Compute a CRC32 over the occupied blocks
    Checksum(commands::checksum::ChecksumArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .init();

    info!("sparseimg CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Info(args) => commands::info::run(args).await,
        Commands::Export(args) => commands::export::run(args).await,
        Commands::Checksum(args) => commands::checksum::run(args).await,
    }
}
