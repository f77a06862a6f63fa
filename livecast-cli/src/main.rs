//! Livecast CLI
//!
//! Record a camera and microphone into HLS or MP4 and upload the stream
//! while it is being made.
//!
//! # Usage
//!
//! ```bash
//! # Record 30 seconds of HLS and mirror it into a local web root
//! livecast record ~/Videos/index.m3u8 --seconds 30 --upload-dir /srv/www
//!
//! # Upload a finished recording
//! livecast upload ~/Videos/<session-id> --upload-dir /srv/www
//!
//! # Show encoders and configuration
//! livecast info
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Livecast - record and upload segmented live streams
#[derive(Parser)]
#[command(name = "livecast")]
#[command(version)]
#[command(about = "Record and upload segmented live streams", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a session, optionally uploading it live
    #[command(alias = "rec")]
    Record(commands::RecordArgs),

    /// Upload a finished HLS recording
    Upload(commands::UploadArgs),

    /// Manage the configuration file
    Config(commands::ConfigArgs),

    /// Show available encoders, features and defaults
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("livecast_core={}", level).parse()?)
        .add_directive(format!("livecast={}", level).parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Record(args) => commands::record(args).await,
        Commands::Upload(args) => commands::upload(args).await,
        Commands::Config(args) => commands::config(args).await,
        Commands::Info => commands::info().await,
    };

    if let Err(e) = &result {
        if let Some(hint) = e
            .downcast_ref::<livecast_core::LivecastError>()
            .and_then(|e| e.user_hint())
        {
            eprintln!("hint: {}", hint);
        }
    }
    result
}
