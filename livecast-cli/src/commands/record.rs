//! Record command - capture, encode and optionally upload live

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use livecast_core::config::{ConfigFile, Session};
use livecast_core::session::{Broadcaster, SessionController, SessionEvent};
use livecast_core::types::{CameraId, Filter};
use livecast_core::Platform;
use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use super::target::{Target, TargetArgs};

/// Arguments for the record command
#[derive(Args)]
pub struct RecordArgs {
    /// Output file: `.m3u8` records HLS segments, `.mp4` a single file.
    /// Files land in a fresh `<session-id>/` directory next to it
    output: PathBuf,

    /// Stop after this many seconds (default: until Ctrl+C)
    #[arg(short, long)]
    seconds: Option<u64>,

    /// Resolution as WIDTHxHEIGHT
    #[arg(short, long)]
    resolution: Option<String>,

    /// Video bitrate in kbps
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// HLS segment duration in seconds
    #[arg(long)]
    segment: Option<u64>,

    /// Capture device index
    #[arg(short, long, default_value = "0")]
    camera: u32,

    /// Filter (none, black-white, night, invert, mirror)
    #[arg(short, long)]
    filter: Option<String>,

    /// Lower the bitrate when uploads fall behind
    #[arg(long)]
    adaptive: bool,

    /// Alternative config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    target: TargetArgs,
}

impl RecordArgs {
    fn session(&self, config: &ConfigFile) -> Result<Session> {
        let output = match (&config.output.directory, self.output.parent()) {
            (Some(dir), Some(parent)) if parent.as_os_str().is_empty() => dir.join(&self.output),
            _ => self.output.clone(),
        };

        let mut builder = config.apply(Session::builder(output))?;
        if let Some(resolution) = &self.resolution {
            let (width, height) = parse_resolution(resolution)?;
            builder = builder.with_resolution(width, height);
        }
        if let Some(kbps) = self.bitrate {
            builder = builder.with_video_bitrate(kbps.saturating_mul(1000));
        }
        if let Some(secs) = self.segment {
            builder = builder.with_segment_duration(Duration::from_secs(secs));
        }
        if let Some(filter) = &self.filter {
            let filter: Filter = filter.parse().map_err(anyhow::Error::msg)?;
            builder = builder.with_filter(filter);
        }
        if self.adaptive {
            builder = builder.with_adaptive_bitrate(true);
        }
        if let Some(prefix) = &self.target.prefix {
            let upload = config.upload_config().with_key_prefix(prefix);
            builder = builder.with_upload(upload);
        }
        Ok(builder.with_camera(CameraId(self.camera)).build()?)
    }
}

fn parse_resolution(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow::anyhow!("Invalid resolution '{}', expected WIDTHxHEIGHT", s))?;
    Ok((
        w.trim().parse().context("Invalid width")?,
        h.trim().parse().context("Invalid height")?,
    ))
}

#[cfg(feature = "ffmpeg")]
fn platform() -> Result<Arc<dyn Platform>> {
    Ok(Arc::new(livecast_core::SoftwarePlatform::new()))
}

#[cfg(not(feature = "ffmpeg"))]
fn platform() -> Result<Arc<dyn Platform>> {
    anyhow::bail!("Recording needs codecs; rebuild with --features ffmpeg")
}

/// Either a plain recording or one uploaded while it is made
enum Recording {
    Local(Arc<SessionController>),
    Live(Arc<Broadcaster>, Target),
}

impl Recording {
    fn controller(&self) -> &Arc<SessionController> {
        match self {
            Recording::Local(controller) => controller,
            Recording::Live(broadcaster, _) => broadcaster.controller(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        match self {
            Recording::Local(controller) => controller.subscribe(),
            Recording::Live(broadcaster, _) => broadcaster.subscribe(),
        }
    }
}

/// Record a session
pub async fn record(args: RecordArgs) -> Result<()> {
    println!("Livecast - Recording\n");

    let config = match &args.config {
        Some(path) => ConfigFile::load_from(path.clone())?,
        None => ConfigFile::load_or_default(),
    };
    let session = args.session(&config)?;
    let target = args.target.resolve(&config)?;
    let platform = platform()?;

    println!("Configuration:");
    println!("  Session:     {}", session.id);
    println!("  Output:      {}", session.output_path.display());
    println!("  Resolution:  {}x{}", session.video.width, session.video.height);
    println!("  Framerate:   {} fps", session.video.frame_rate);
    println!("  Bitrate:     {} kbps", session.video.bitrate / 1000);
    println!("  Audio:       {} Hz, {} ch", session.audio.sample_rate, session.audio.channels);
    println!("  Muxer:       {}", session.muxer);
    println!("  Filter:      {}", session.filter);
    println!();

    let recording = match target {
        Some(target) => {
            let broadcaster = Broadcaster::new(platform, session.clone(), Arc::clone(&target.provider))?;
            Recording::Live(Arc::new(broadcaster), target)
        }
        None => Recording::Local(Arc::new(SessionController::new(platform, session.clone()))),
    };

    let fatal = Arc::new(Notify::new());
    let printer = tokio::spawn(print_events(recording.subscribe(), Arc::clone(&fatal)));

    match &recording {
        Recording::Local(controller) => {
            controller.prepare(None).context("Failed to prepare capture")?;
            controller.start()?;
        }
        Recording::Live(broadcaster, target) => {
            broadcaster.prepare(None).context("Failed to prepare capture")?;
            broadcaster.start()?;
            broadcaster.resolve_credentials(&target.credentials)?;
        }
    }

    match args.seconds {
        Some(secs) => println!("Recording for {} seconds (Ctrl+C to stop early)...\n", secs),
        None => println!("Recording. Press Ctrl+C to stop...\n"),
    }

    let deadline = async {
        match args.seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    let controller = Arc::clone(recording.controller());
    let progress = async {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!("{} frames encoded", controller.frames_processed());
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            println!("\nReceived interrupt signal...");
        }
        _ = deadline => {}
        _ = fatal.notified() => {
            warn!("Recording failed, shutting down");
        }
        _ = progress => {}
    }

    println!("Stopping...");
    let frames = controller.frames_processed();
    let summary = tokio::task::spawn_blocking(move || -> Result<Option<(u64, u64, u64)>> {
        match &recording {
            Recording::Local(controller) => {
                controller.stop()?;
                Ok(None)
            }
            Recording::Live(broadcaster, _) => {
                let stopped = broadcaster.stop();
                println!("Waiting for uploads to finish...");
                broadcaster.wait_for_uploads();
                stopped?;
                let uploads = broadcaster.uploads();
                Ok(Some((uploads.completed(), uploads.failed(), uploads.bytes_uploaded())))
            }
        }
    })
    .await
    .context("Shutdown task panicked")??;
    printer.abort();

    println!("\nRecording finished.");
    println!("  Frames:   {}", frames);
    println!("  Output:   {}", session.output_path.display());
    if let Some((completed, failed, bytes)) = summary {
        println!("  Uploaded: {} files, {} KiB", completed, bytes / 1024);
        if failed > 0 {
            println!("  Failed:   {} (re-run `livecast upload` to retry)", failed);
        }
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>, fatal: Arc<Notify>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Live { watch_url }) => println!("Live at {}", watch_url),
            Ok(SessionEvent::ThumbnailWritten { path }) => {
                println!("Thumbnail: {}", path.display())
            }
            Ok(SessionEvent::UploadFailed { key, detail }) => {
                eprintln!("Upload of {} failed: {}", key, detail)
            }
            Ok(SessionEvent::Error { kind, detail }) => {
                eprintln!("Error ({}): {}", kind, detail);
                if kind.is_fatal() {
                    fatal.notify_one();
                }
            }
            Ok(event) => tracing::debug!("{:?}", event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} session events", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1280x720").unwrap(), (1280, 720));
        assert_eq!(parse_resolution("640X360").unwrap(), (640, 360));
        assert!(parse_resolution("720p").is_err());
        assert!(parse_resolution("axb").is_err());
    }
}
