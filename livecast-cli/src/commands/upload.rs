//! Upload command - push a finished HLS recording

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use livecast_core::config::{ConfigFile, UploadConfig};
use livecast_core::mux::MediaPlaylist;
use livecast_core::session::{vod_playlist_path, EventBus};
use livecast_core::upload::{UploadManager, UploadTask};

use super::target::TargetArgs;

/// Arguments for the upload command
#[derive(Args)]
pub struct UploadArgs {
    /// Recording directory (`<output-dir>/<session-id>/`)
    recording: PathBuf,

    #[command(flatten)]
    target: TargetArgs,
}

/// Playlist uploads are planned from
struct Source {
    /// Where the segment list is read from
    playlist: PathBuf,
    /// Remote name of the manifest (`index.m3u8`)
    manifest_name: String,
}

/// The recording's own playlist names the manifest; a broadcast's VOD
/// playlist, when present, lists every segment rather than the live window
fn find_source(dir: &Path) -> Result<Source> {
    let mut playlists: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "m3u8"))
        .collect();
    playlists.sort();
    let own = playlists
        .first()
        .with_context(|| format!("No .m3u8 playlist in {}", dir.display()))?;
    let manifest_name = own
        .file_name()
        .and_then(|n| n.to_str())
        .context("Playlist name is not valid UTF-8")?
        .to_string();

    let vod = vod_playlist_path(dir);
    let playlist = if vod.is_file() { vod } else { own.clone() };
    Ok(Source {
        playlist,
        manifest_name,
    })
}

/// Tasks for every listed segment followed by the playlist itself
fn plan(dir: &Path, prefix: &str) -> Result<(Vec<UploadTask>, MediaPlaylist)> {
    let source = find_source(dir)?;
    let text = std::fs::read_to_string(&source.playlist)
        .with_context(|| format!("Failed to read {}", source.playlist.display()))?;
    let playlist = MediaPlaylist::parse(&text)?;

    let mut tasks = Vec::with_capacity(playlist.entries.len() + 1);
    for entry in &playlist.entries {
        let file = dir.join(&entry.uri);
        if !file.is_file() {
            anyhow::bail!("Segment {} listed in the playlist is missing", file.display());
        }
        tasks.push(UploadTask::new(format!("{}/{}", prefix, entry.uri), file));
    }
    tasks.push(
        UploadTask::new(format!("{}/{}", prefix, source.manifest_name), source.playlist).terminal(),
    );
    Ok((tasks, playlist))
}

/// Upload a recording, playlist last
pub async fn upload(args: UploadArgs) -> Result<()> {
    let config = ConfigFile::load_or_default();
    let target = args
        .target
        .resolve(&config)?
        .context("No upload destination; pass --upload-dir or --bucket")?;

    // the recording directory is named after the session id
    let prefix = match &args.target.prefix {
        Some(prefix) => prefix.clone(),
        None => args
            .recording
            .file_name()
            .and_then(|n| n.to_str())
            .context("Cannot derive a key prefix; pass --prefix")?
            .to_string(),
    };

    let (tasks, playlist) = plan(&args.recording, &prefix)?;
    if !playlist.ended {
        println!("Warning: playlist has no end marker; the recording may be incomplete");
    }
    println!(
        "Uploading {} segments to {} under {}/",
        playlist.entries.len(),
        target.credentials.bucket,
        prefix
    );

    let uploads = Arc::new(UploadManager::new(
        UploadConfig::for_segment_duration(Duration::from_secs(config.output.segment_duration))
            .with_idle_timeout(None),
        target.provider,
        EventBus::new(),
    ));
    for task in tasks {
        uploads.enqueue(task);
    }
    uploads.resolve_credentials(&target.credentials)?;

    let waiter = Arc::clone(&uploads);
    tokio::task::spawn_blocking(move || waiter.join())
        .await
        .context("Upload task panicked")?;

    println!(
        "Uploaded {} files ({} KiB), {} failed",
        uploads.completed(),
        uploads.bytes_uploaded() / 1024,
        uploads.failed()
    );
    if uploads.failed() > 0 {
        anyhow::bail!("{} uploads failed", uploads.failed());
    }
    Ok(())
}
