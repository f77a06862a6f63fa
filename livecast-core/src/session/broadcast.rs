//! Live broadcast: recording, segment watching and ordered upload
//!
//! The live playlist is rewritten in place while recording, so every change
//! is snapshot-copied before it is queued. A VOD playlist collecting every
//! segment is kept beside the snapshots and replaces the live one as the
//! terminal upload once the stream has ended.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::{EventBus, SessionController, SessionEvent};
use crate::capture::PreviewTarget;
use crate::config::{MuxerStrategy, Session, MIN_ADAPTIVE_BITRATE};
use crate::error::{LivecastError, Result};
use crate::mux::hls::write_atomic;
use crate::mux::MediaPlaylist;
use crate::platform::Platform;
use crate::types::{Segment, SegmentKind};
use crate::upload::{
    StorageCredentials, StoreProvider, UploadListener, UploadManager, UploadOutcome, UploadTask,
};
use crate::watch::{SegmentEvent, SegmentWatcher};

/// Thumbnail taken once this many frames were recorded
const THUMBNAIL_FRAME: u64 = 60;
const THUMBNAIL_SCALE: u32 = 2;

const SNAPSHOT_DIR: &str = "m3u8";
const VOD_PLAYLIST: &str = "vod.m3u8";
const THUMBNAIL_KEY: &str = "thumb.jpg";

/// VOD playlist a broadcast leaves in its recording directory
pub fn vod_playlist_path(recording_dir: &Path) -> PathBuf {
    recording_dir.join(SNAPSHOT_DIR).join(VOD_PLAYLIST)
}

/// What has been queued so far
struct Progress {
    prefix: String,
    manifest_name: String,
    snapshot_dir: PathBuf,
    snapshots: u64,
    vod: MediaPlaylist,
    vod_uris: HashSet<String>,
    terminal_enqueued: bool,
}

impl Progress {
    fn new(session: &Session) -> Self {
        let manifest_name = session
            .output_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("index.m3u8")
            .to_string();
        Self {
            prefix: session.key_prefix(),
            manifest_name,
            snapshot_dir: session.output_dir().join(SNAPSHOT_DIR),
            snapshots: 0,
            vod: MediaPlaylist::new(session.segment_duration.as_secs().max(1)),
            vod_uris: HashSet::new(),
            terminal_enqueued: false,
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    fn manifest_key(&self) -> String {
        self.key(&self.manifest_name)
    }

    fn vod_path(&self) -> PathBuf {
        self.snapshot_dir.join(VOD_PLAYLIST)
    }

    /// Task for a watcher event, if it needs uploading
    fn task_for(&mut self, event: &SegmentEvent) -> Result<Option<UploadTask>> {
        if event.kind == SegmentKind::Thumbnail {
            return Ok(Some(UploadTask::new(self.key(THUMBNAIL_KEY), &event.path)));
        }
        Ok(self.segment_for(event)?.map(|segment| self.task(&segment)))
    }

    fn segment_for(&mut self, event: &SegmentEvent) -> Result<Option<Segment>> {
        let Some(name) = event.path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        match event.kind {
            SegmentKind::MediaSegment => Ok(Some(Segment::media(&event.path))),
            SegmentKind::Manifest if name == self.manifest_name && !self.terminal_enqueued => {
                self.on_manifest(&event.path).map(Some)
            }
            SegmentKind::Manifest | SegmentKind::Thumbnail => {
                debug!("Ignoring {:?}", event.path);
                Ok(None)
            }
        }
    }

    /// Manifests upload under the live playlist's key, media under their own name
    fn task(&self, segment: &Segment) -> UploadTask {
        let key = if segment.is_manifest {
            self.manifest_key()
        } else {
            let name = segment
                .local_file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            self.key(name)
        };
        debug!(
            "Queueing {:?} (#{}) as {}",
            segment.local_file, segment.sequence_index, key
        );
        UploadTask::for_segment(key, segment)
    }

    fn on_manifest(&mut self, path: &Path) -> Result<Segment> {
        let text = std::fs::read_to_string(path)?;
        let live = MediaPlaylist::parse(&text)?;
        for entry in &live.entries {
            if self.vod_uris.insert(entry.uri.clone()) {
                self.vod.push(entry.uri.clone(), entry.duration);
            }
        }
        self.vod.target_duration = self.vod.target_duration.max(live.target_duration);

        if live.ended {
            return self.finish();
        }

        std::fs::create_dir_all(&self.snapshot_dir)?;
        let stem = Path::new(&self.manifest_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("index");
        let sequence = self.snapshots;
        let snapshot = self.snapshot_dir.join(format!("{}_{}.m3u8", stem, sequence));
        self.snapshots += 1;
        std::fs::write(&snapshot, &text)?;
        write_atomic(&self.vod_path(), self.vod.render().as_bytes())?;

        debug!(
            "Manifest snapshot {:?} ({} live entries)",
            snapshot,
            live.entries.len()
        );
        Ok(Segment::manifest(snapshot, sequence, false))
    }

    /// Close the VOD playlist and hand it over as the last manifest
    fn finish(&mut self) -> Result<Segment> {
        std::fs::create_dir_all(&self.snapshot_dir)?;
        self.vod.ended = true;
        let path = self.vod_path();
        write_atomic(&path, self.vod.render().as_bytes())?;
        self.terminal_enqueued = true;
        info!(
            "VOD playlist with {} segments queued as {}",
            self.vod.entries.len(),
            self.manifest_key()
        );
        Ok(Segment::manifest(path, self.snapshots, true))
    }
}

/// A recording that is uploaded while it is made
pub struct Broadcaster {
    session: Session,
    controller: Arc<SessionController>,
    uploads: Arc<UploadManager>,
    watcher: Mutex<Option<SegmentWatcher>>,
    progress: Arc<Mutex<Progress>>,
    events: EventBus,
}

impl Broadcaster {
    pub fn new(
        platform: Arc<dyn Platform>,
        session: Session,
        provider: Arc<dyn StoreProvider>,
    ) -> Result<Self> {
        if session.muxer != MuxerStrategy::SegmentedStream {
            return Err(LivecastError::config(format!(
                "Broadcasting needs a segmented (.m3u8) output, not {}",
                session.output_path.display()
            )));
        }
        let events = EventBus::new();
        let controller = Arc::new(SessionController::with_events(
            platform,
            session.clone(),
            events.clone(),
        ));
        let progress = Progress::new(&session);
        let listener = upload_listener(
            &session,
            progress.manifest_key(),
            Arc::downgrade(&controller),
            events.clone(),
        );
        let uploads = Arc::new(
            UploadManager::new(session.upload.clone(), provider, events.clone()).with_listener(listener),
        );

        Ok(Self {
            session,
            controller,
            uploads,
            watcher: Mutex::new(None),
            progress: Arc::new(Mutex::new(progress)),
            events,
        })
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn prepare(&self, preview: Option<PreviewTarget>) -> Result<()> {
        self.controller.prepare(preview)
    }

    /// Watch the output directory and start recording
    pub fn start(&self) -> Result<()> {
        {
            let mut watcher = self.watcher.lock();
            if watcher.is_none() {
                let progress = Arc::clone(&self.progress);
                let uploads = Arc::clone(&self.uploads);
                *watcher = Some(SegmentWatcher::start(self.session.output_dir(), move |event| {
                    let mut progress = progress.lock();
                    match progress.task_for(&event) {
                        Ok(Some(task)) => uploads.enqueue(task),
                        Ok(None) => {}
                        Err(e) => warn!("Could not queue {:?}: {}", event.path, e),
                    }
                })?);
            }
        }
        self.controller.start()?;
        if let Err(e) = self
            .controller
            .request_thumbnail(Some(THUMBNAIL_FRAME), THUMBNAIL_SCALE)
        {
            warn!("Thumbnail request failed: {}", e);
        }
        Ok(())
    }

    /// Credentials arrived; held uploads go out in order
    pub fn resolve_credentials(&self, credentials: &StorageCredentials) -> Result<()> {
        self.uploads.resolve_credentials(credentials)?;
        self.events.emit(SessionEvent::Started);
        Ok(())
    }

    /// Stop recording, queue what is left and the terminal VOD playlist
    pub fn stop(&self) -> Result<()> {
        let result = self.controller.stop();

        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
        let mut progress = self.progress.lock();
        if !progress.terminal_enqueued {
            match progress.finish() {
                Ok(segment) => self.uploads.enqueue(progress.task(&segment)),
                Err(e) => warn!("Could not write the VOD playlist: {}", e),
            }
        }
        result
    }

    /// Block until the uploader has finished
    pub fn wait_for_uploads(&self) {
        self.uploads.join();
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }
}

/// Fires `Live` on the first manifest upload and lowers the bitrate when
/// uploads fall behind
fn upload_listener(
    session: &Session,
    manifest_key: String,
    controller: Weak<SessionController>,
    events: EventBus,
) -> UploadListener {
    let live = AtomicBool::new(false);
    let adaptive = session.adaptive_bitrate;
    let total_bitrate = session.total_bitrate() as u64;
    let video_bitrate = session.video.bitrate as u64;

    Arc::new(move |task: &UploadTask, outcome: &UploadOutcome| {
        let UploadOutcome::Completed {
            bytes_per_sec, url, ..
        } = outcome
        else {
            return;
        };
        if task.destination_key == manifest_key && !live.swap(true, Ordering::SeqCst) {
            info!("Live at {}", url);
            events.emit(SessionEvent::Live {
                watch_url: url.clone(),
            });
        }

        let is_segment = SegmentKind::from_path(Path::new(&task.destination_key))
            == Some(SegmentKind::MediaSegment);
        if adaptive && is_segment && *bytes_per_sec < total_bitrate {
            let target = (*bytes_per_sec)
                .min(video_bitrate)
                .max(MIN_ADAPTIVE_BITRATE as u64) as u32;
            if let Some(controller) = controller.upgrade() {
                debug!("Upload at {} B/s, lowering video bitrate to {}", bytes_per_sec, target);
                if let Err(e) = controller.adjust_bitrate(target) {
                    debug!("Bitrate not adjusted: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(dir: &Path) -> Session {
        Session::builder(dir.join("index.m3u8")).build().unwrap()
    }

    fn live_playlist(entries: &[&str], ended: bool) -> String {
        let mut playlist = MediaPlaylist::new(10);
        for uri in entries {
            playlist.push(*uri, 10.0);
        }
        playlist.ended = ended;
        playlist.render()
    }

    #[test]
    fn test_manifest_snapshots_and_vod() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let manifest = session.output_path.clone();
        let mut progress = Progress::new(&session);
        let event = SegmentEvent {
            kind: SegmentKind::Manifest,
            path: manifest.clone(),
        };

        std::fs::write(&manifest, live_playlist(&["index0.ts"], false)).unwrap();
        let first = progress.task_for(&event).unwrap().unwrap();
        std::fs::write(&manifest, live_playlist(&["index0.ts", "index1.ts"], false)).unwrap();
        let second = progress.task_for(&event).unwrap().unwrap();

        assert_eq!(first.destination_key, format!("{}/index.m3u8", session.id));
        assert_ne!(first.source_file, second.source_file);
        assert!(first.source_file.starts_with(session.output_dir().join("m3u8")));
        assert!(!second.is_terminal);

        // sliding window dropped index0, the VOD keeps it
        std::fs::write(&manifest, live_playlist(&["index1.ts", "index2.ts"], true)).unwrap();
        let last = progress.task_for(&event).unwrap().unwrap();
        assert!(last.is_terminal);
        let vod = MediaPlaylist::parse(&std::fs::read_to_string(&last.source_file).unwrap()).unwrap();
        let uris: Vec<_> = vod.entries.iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(uris, vec!["index0.ts", "index1.ts", "index2.ts"]);
        assert!(vod.ended);

        // nothing after the terminal playlist
        assert!(progress.task_for(&event).unwrap().is_none());
    }

    #[test]
    fn test_segment_and_thumbnail_keys() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let mut progress = Progress::new(&session);
        let segment = progress
            .task_for(&SegmentEvent {
                kind: SegmentKind::MediaSegment,
                path: session.output_dir().join("index3.ts"),
            })
            .unwrap()
            .unwrap();
        assert_eq!(segment.destination_key, format!("{}/index3.ts", session.id));

        let thumb = progress
            .task_for(&SegmentEvent {
                kind: SegmentKind::Thumbnail,
                path: session.output_dir().join("thumb_123.jpg"),
            })
            .unwrap()
            .unwrap();
        assert_eq!(thumb.destination_key, format!("{}/thumb.jpg", session.id));
    }

    #[test]
    fn test_segments_carry_sequence_and_last_flag() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let manifest = session.output_path.clone();
        let mut progress = Progress::new(&session);

        let media = progress
            .segment_for(&SegmentEvent {
                kind: SegmentKind::MediaSegment,
                path: session.output_dir().join("index3.ts"),
            })
            .unwrap()
            .unwrap();
        assert_eq!(media.sequence_index, 3);
        assert!(!progress.task(&media).is_terminal);

        let event = SegmentEvent {
            kind: SegmentKind::Manifest,
            path: manifest.clone(),
        };
        std::fs::write(&manifest, live_playlist(&["index0.ts"], false)).unwrap();
        let first = progress.segment_for(&event).unwrap().unwrap();
        assert_eq!((first.sequence_index, first.is_manifest, first.is_last), (0, true, false));

        std::fs::write(&manifest, live_playlist(&["index0.ts"], true)).unwrap();
        let last = progress.segment_for(&event).unwrap().unwrap();
        assert!(last.is_manifest && last.is_last);
        assert_eq!(last.local_file, vod_playlist_path(session.output_dir()));
        let task = progress.task(&last);
        assert!(task.is_terminal);
        assert_eq!(task.destination_key, format!("{}/index.m3u8", session.id));
    }
}
