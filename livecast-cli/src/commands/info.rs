//! Info command - show encoders, build features and defaults

use anyhow::Result;
use livecast_core::config::ConfigFile;
use livecast_core::types::Filter;

/// Show build and configuration information
pub async fn info() -> Result<()> {
    println!("Livecast - System Information\n");

    println!("Build Features:");
    println!("  ffmpeg (record): {}", yes_no(cfg!(feature = "ffmpeg")));
    println!("  s3 (upload):     {}", yes_no(cfg!(feature = "s3")));
    println!();

    print_encoders();

    println!("Configuration:");
    let path = ConfigFile::default_path();
    println!(
        "  File:        {} ({})",
        path.display(),
        if path.exists() { "exists" } else { "not found, using defaults" }
    );
    let config = ConfigFile::load_or_default();
    println!("  Resolution:  {}x{}", config.video.width, config.video.height);
    println!("  Bitrate:     {} kbps", config.video.bitrate);
    println!("  Framerate:   {} fps", config.video.frame_rate);
    println!(
        "  Audio:       {} Hz, {} ch, {} kbps",
        config.audio.sample_rate, config.audio.channels, config.audio.bitrate
    );
    println!("  Segments:    {} s, {} in the live playlist", config.output.segment_duration, config.output.playlist_size);
    match (&config.upload.local_dir, &config.upload.bucket) {
        (Some(dir), _) => println!("  Upload to:   {}", dir.display()),
        (None, Some(bucket)) => println!("  Upload to:   s3://{}", bucket),
        (None, None) => println!("  Upload to:   (none)"),
    }

    println!();
    println!("Filters:");
    for filter in Filter::ALL {
        println!("  {:>2}  {}", filter.id(), filter);
    }

    println!();
    println!("Output formats:");
    println!("  .m3u8 - HLS (MPEG-TS segments, uploadable while recording)");
    println!("  .mp4  - Single container file");

    Ok(())
}

#[cfg(feature = "ffmpeg")]
fn print_encoders() {
    println!("Video Encoders:");
    let encoders = livecast_core::encode::available_video_encoders();
    if encoders.is_empty() {
        println!("  No H.264 encoder found in the linked FFmpeg.");
    } else {
        for encoder in &encoders {
            println!("  - {}", encoder);
        }
    }
    println!();
}

#[cfg(not(feature = "ffmpeg"))]
fn print_encoders() {
    println!("Video Encoders:");
    println!("  (built without ffmpeg)");
    println!();
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
