//! Config command - inspect, check and create the config file

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use livecast_core::config::{sample_config, ConfigFile};
use livecast_core::types::Filter;
use std::path::{Path, PathBuf};

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    /// Config file to use instead of the default location
    #[arg(long)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print where the config file is read from
    Path,

    /// Show the effective settings, section by section
    Show {
        /// Print the file as written instead
        #[arg(long)]
        raw: bool,
    },

    /// Report values a recording would reject
    Check,

    /// Write the sample config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the sample config to stdout
    Sample,
}

/// Run config subcommand
pub async fn config(args: ConfigArgs) -> Result<()> {
    let path = args.file.clone().unwrap_or_else(ConfigFile::default_path);

    match args.command {
        ConfigCommand::Path => {
            let state = if path.exists() { "exists" } else { "not found, defaults apply" };
            println!("{} ({})", path.display(), state);
        }
        ConfigCommand::Show { raw: true } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            print!("{}", content);
        }
        ConfigCommand::Show { raw: false } => {
            let config = ConfigFile::load_from(path.clone())?;
            show(&path, &config);
            for problem in problems(&config) {
                println!("Warning: {}", problem);
            }
        }
        ConfigCommand::Check => {
            let config = ConfigFile::load_from(path.clone())?;
            let problems = problems(&config);
            if problems.is_empty() {
                println!("{}: ok", path.display());
                return Ok(());
            }
            for problem in &problems {
                println!("  - {}", problem);
            }
            anyhow::bail!("{} problem(s) in {}", problems.len(), path.display());
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                println!("Configuration file already exists: {}", path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }
            if args.file.is_none() && !force {
                ConfigFile::create_default_if_missing()?;
            } else {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).context("Failed to create config directory")?;
                }
                std::fs::write(&path, sample_config()).context("Failed to write config file")?;
            }
            println!("Created configuration file: {}", path.display());
        }
        ConfigCommand::Sample => {
            print!("{}", sample_config());
        }
    }

    Ok(())
}

fn show(path: &Path, config: &ConfigFile) {
    let source = if path.exists() { "" } else { " (no file, defaults)" };
    println!("Configuration: {}{}\n", path.display(), source);

    let video = &config.video;
    println!("[video]");
    println!("  resolution    {}x{}", video.width, video.height);
    println!("  bitrate       {} kbps", video.bitrate);
    println!("  frame rate    {} fps", video.frame_rate);
    println!(
        "  keyframes     every {} s ({} frames)",
        video.keyframe_interval,
        config.video_config().gop_size()
    );

    let audio = &config.audio;
    println!("[audio]");
    println!(
        "  AAC           {} Hz, {} ch, {} kbps",
        audio.sample_rate, audio.channels, audio.bitrate
    );

    let output = &config.output;
    println!("[output]");
    match &output.directory {
        Some(dir) => println!("  directory     {}", dir.display()),
        None => println!("  directory     (current directory)"),
    }
    println!(
        "  segments      {} s, {} in the live playlist",
        output.segment_duration, output.playlist_size
    );
    println!("  filter        {}", output.filter);
    println!("  adaptive      {}", if output.adaptive_bitrate { "yes" } else { "no" });

    let upload = &config.upload;
    println!("[upload]");
    match (&upload.local_dir, &upload.bucket) {
        (Some(dir), _) => println!("  destination   {}", dir.display()),
        (None, Some(bucket)) => println!("  destination   s3://{}", bucket),
        (None, None) => println!("  destination   (none, record only)"),
    }
    if upload.bucket.is_some() {
        println!("  region        {}", upload.region.as_deref().unwrap_or("(AWS default)"));
        if let Some(endpoint) = &upload.endpoint {
            println!("  endpoint      {}", endpoint);
        }
    }
    if let Some(url) = &upload.public_url {
        println!("  public url    {}", url);
    }
    match config.upload_config().idle_timeout {
        Some(timeout) => println!("  idle timeout  {} s", timeout.as_secs()),
        None => println!("  idle timeout  none (waits for the last segment)"),
    }
    println!(
        "  key prefix    {}",
        upload.key_prefix.as_deref().unwrap_or("(session id)")
    );
    println!();
}

/// Settings a recording would reject or that probably do not do what was meant
fn problems(config: &ConfigFile) -> Vec<String> {
    let mut problems = Vec::new();
    if let Err(e) = config.output.filter.parse::<Filter>() {
        problems.push(e);
    }
    if let Err(e) = config.video_config().validate() {
        problems.push(e.to_string());
    }
    if let Err(e) = config.audio_config().validate() {
        problems.push(e.to_string());
    }
    if config.output.segment_duration == 0 {
        problems.push("segment_duration must be at least 1 s".to_string());
    }
    if config.output.playlist_size == 0 {
        problems.push("playlist_size must keep at least one entry".to_string());
    }

    let upload = &config.upload;
    if upload.local_dir.is_some() && upload.bucket.is_some() {
        problems.push("both local_dir and bucket are set; uploads go to local_dir".to_string());
    }
    if upload.bucket.is_some() && !cfg!(feature = "s3") {
        problems.push("bucket is set but this build has no S3 support".to_string());
    }
    if let Some(timeout) = upload.idle_timeout.filter(|t| *t > 0) {
        if timeout < config.output.segment_duration {
            problems.push(format!(
                "idle_timeout {} s is shorter than one segment; the uploader will exit mid-recording",
                timeout
            ));
        }
    }
    problems
}
