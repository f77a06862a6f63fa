//! Video worker thread
//!
//! One worker per recording owns the capture device, the filter stage and
//! the video encoder. Everything else talks to it through an ordered
//! command mailbox, so none of that state is ever shared.
//!
//! The creating thread blocks until the worker has published its mailbox;
//! no command can be posted before the worker is listening.

use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::{write_thumbnail, CaptureDevice, FilterStage, PreviewTarget};
use crate::config::{Session, VideoEncoderConfig};
use crate::encode::VideoEncoder;
use crate::error::{LivecastError, Result};
use crate::mux::SharedMuxer;
use crate::platform::Platform;
use crate::session::{EventBus, SessionEvent};
use crate::types::{CameraId, Filter, TrackIndex};

/// How long `spawn` waits for the worker to publish its mailbox
const MAILBOX_TIMEOUT: Duration = Duration::from_secs(5);

const NO_FILTER_CHANGE: u32 = u32::MAX;
const NO_TRACK: usize = usize::MAX;

/// Worker mailbox commands
pub enum Command {
    /// Open the capture device and encoder; preview redraws go to the target
    Prepare(Option<PreviewTarget>),
    /// The capture device has a new frame
    FrameAvailable,
    ChangeFilter(Filter),
    StartRecording,
    /// Flush the encoder, release everything and exit
    StopRecording,
    SetCaptureDevice(CameraId),
    AdjustBitrate(u32),
    /// Write a thumbnail once `on_frame` frames were processed (next frame
    /// when `None`)
    RequestThumbnail { on_frame: Option<u64>, scale: u32 },
    /// Release everything without flushing and exit
    Quit,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Prepare(preview) => write!(f, "Prepare(preview={})", preview.is_some()),
            Command::FrameAvailable => write!(f, "FrameAvailable"),
            Command::ChangeFilter(filter) => write!(f, "ChangeFilter({})", filter),
            Command::StartRecording => write!(f, "StartRecording"),
            Command::StopRecording => write!(f, "StopRecording"),
            Command::SetCaptureDevice(id) => write!(f, "SetCaptureDevice({})", id),
            Command::AdjustBitrate(bps) => write!(f, "AdjustBitrate({})", bps),
            Command::RequestThumbnail { on_frame, scale } => {
                write!(f, "RequestThumbnail({:?}, 1/{})", on_frame, scale)
            }
            Command::Quit => write!(f, "Quit"),
        }
    }
}

/// Handle capture devices use to announce frames
#[derive(Clone)]
pub struct FrameNotifier {
    tx: Sender<Command>,
}

impl FrameNotifier {
    /// Post `FrameAvailable`; false once the worker has gone away
    pub fn notify(&self) -> bool {
        self.tx.send(Command::FrameAvailable).is_ok()
    }
}

/// Presentation-time origin shared by the video and audio threads
///
/// Fixed by the video worker when it processes the first frame after
/// recording starts; audio waits for it.
#[derive(Debug, Clone, Default)]
pub struct RecordingClock(Arc<OnceLock<Instant>>);

impl RecordingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time zero, once the first frame has fixed it
    pub fn origin(&self) -> Option<Instant> {
        self.0.get().copied()
    }

    pub fn is_started(&self) -> bool {
        self.0.get().is_some()
    }

    /// Microseconds since the origin, fixing the origin at `now` if unset
    pub fn elapsed_us(&self, now: Instant) -> i64 {
        let origin = *self.0.get_or_init(|| now);
        now.saturating_duration_since(origin).as_micros() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// State readable from outside the worker
struct Shared {
    mailbox: Mutex<Option<Sender<Command>>>,
    mailbox_ready: Condvar,
    readiness: Mutex<Readiness>,
    readiness_changed: Condvar,
    /// Filter requested by the host, applied by the worker on the next frame
    pending_filter: AtomicU32,
    filter: AtomicU32,
    camera: AtomicU32,
    recording: AtomicBool,
    running: AtomicBool,
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    video_track: AtomicUsize,
}

impl Shared {
    fn set_readiness(&self, readiness: Readiness) {
        *self.readiness.lock() = readiness;
        self.readiness_changed.notify_all();
    }
}

/// The video worker thread and its mailbox
pub struct FrameSource {
    tx: Sender<Command>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Spawn the worker and wait for its mailbox
    pub fn spawn(
        platform: Arc<dyn Platform>,
        session: &Session,
        muxer: SharedMuxer,
        clock: RecordingClock,
        events: EventBus,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            mailbox: Mutex::new(None),
            mailbox_ready: Condvar::new(),
            readiness: Mutex::new(Readiness::Pending),
            readiness_changed: Condvar::new(),
            pending_filter: AtomicU32::new(NO_FILTER_CHANGE),
            filter: AtomicU32::new(session.filter.id()),
            camera: AtomicU32::new(session.camera.0),
            recording: AtomicBool::new(false),
            running: AtomicBool::new(true),
            frames_processed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            video_track: AtomicUsize::new(NO_TRACK),
        });

        let worker_shared = Arc::clone(&shared);
        let video = session.video;
        let output_dir = session.output_dir().to_path_buf();
        let thread = std::thread::Builder::new()
            .name("livecast-video".to_string())
            .spawn(move || {
                let (tx, rx) = mpsc::channel();
                let mut worker = Worker {
                    platform,
                    video,
                    output_dir,
                    muxer,
                    clock,
                    events,
                    notifier: FrameNotifier { tx: tx.clone() },
                    shared: Arc::clone(&worker_shared),
                    encoder: None,
                    camera: None,
                    filter_stage: None,
                    preview: None,
                    last_pts: None,
                    thumbnail: None,
                };
                *worker_shared.mailbox.lock() = Some(tx);
                worker_shared.mailbox_ready.notify_all();
                worker.run(rx);
            })
            .map_err(|e| LivecastError::hardware(format!("Failed to spawn video worker: {}", e)))?;

        let tx = {
            let mut mailbox = shared.mailbox.lock();
            let deadline = Instant::now() + MAILBOX_TIMEOUT;
            while mailbox.is_none() {
                if shared.mailbox_ready.wait_until(&mut mailbox, deadline).timed_out() {
                    break;
                }
            }
            mailbox.take()
        };
        let tx = tx.ok_or_else(|| LivecastError::hardware("Video worker never published its mailbox"))?;

        debug!("Video worker mailbox ready");
        Ok(Self {
            tx,
            shared,
            thread: Some(thread),
        })
    }

    /// Post a command; fails once the worker has exited
    pub fn post(&self, command: Command) -> Result<()> {
        trace!("Posting {:?}", command);
        self.tx
            .send(command)
            .map_err(|e| LivecastError::invalid_state("post", format!("worker exited ({:?})", e.0)))
    }

    pub fn notifier(&self) -> FrameNotifier {
        FrameNotifier {
            tx: self.tx.clone(),
        }
    }

    pub fn prepare(&self, preview: Option<PreviewTarget>) -> Result<()> {
        self.post(Command::Prepare(preview))
    }

    /// Block until `Prepare` completed or failed
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut readiness = self.shared.readiness.lock();
        loop {
            match &*readiness {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(reason) => return Err(LivecastError::hardware(reason.clone())),
                Readiness::Pending => {}
            }
            if !self.is_running() {
                return Err(LivecastError::invalid_state("wait_until_ready", "worker exited"));
            }
            if self
                .shared
                .readiness_changed
                .wait_until(&mut readiness, deadline)
                .timed_out()
            {
                return Err(LivecastError::hardware("Capture pipeline did not become ready"));
            }
        }
    }

    pub fn start_recording(&self) -> Result<()> {
        self.post(Command::StartRecording)
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.post(Command::StopRecording)
    }

    /// Request a filter; takes effect on the next frame without waiting on
    /// the encoder
    pub fn change_filter(&self, filter: Filter) -> Result<()> {
        self.shared.pending_filter.store(filter.id(), Ordering::SeqCst);
        self.post(Command::ChangeFilter(filter))
    }

    pub fn set_capture_device(&self, id: CameraId) -> Result<()> {
        self.post(Command::SetCaptureDevice(id))
    }

    pub fn adjust_bitrate(&self, bitrate: u32) -> Result<()> {
        self.post(Command::AdjustBitrate(bitrate))
    }

    pub fn request_thumbnail(&self, on_frame: Option<u64>, scale: u32) -> Result<()> {
        self.post(Command::RequestThumbnail { on_frame, scale })
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.readiness.lock() == Readiness::Ready
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    /// Whether the worker loop is still running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Frames rendered since recording started (or since prepare)
    pub fn frames_processed(&self) -> u64 {
        self.shared.frames_processed.load(Ordering::SeqCst)
    }

    /// `FrameAvailable` events dropped because the pipeline was not ready
    pub fn frames_dropped(&self) -> u64 {
        self.shared.frames_dropped.load(Ordering::SeqCst)
    }

    /// Filter currently applied (or about to be)
    pub fn filter(&self) -> Filter {
        let pending = self.shared.pending_filter.load(Ordering::SeqCst);
        let id = if pending == NO_FILTER_CHANGE {
            self.shared.filter.load(Ordering::SeqCst)
        } else {
            pending
        };
        Filter::from_id(id).unwrap_or_default()
    }

    pub fn camera(&self) -> CameraId {
        CameraId(self.shared.camera.load(Ordering::SeqCst))
    }

    /// Muxer track the video encoder registered
    pub fn video_track(&self) -> Option<TrackIndex> {
        match self.shared.video_track.load(Ordering::SeqCst) {
            NO_TRACK => None,
            n => Some(TrackIndex(n)),
        }
    }

    /// Wait for the worker loop to exit
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Video worker panicked");
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.tx.send(Command::Quit);
            self.join();
        }
    }
}

/// Worker-owned state; lives only on the worker thread
struct Worker {
    platform: Arc<dyn Platform>,
    video: VideoEncoderConfig,
    output_dir: PathBuf,
    muxer: SharedMuxer,
    clock: RecordingClock,
    events: EventBus,
    notifier: FrameNotifier,
    shared: Arc<Shared>,
    encoder: Option<VideoEncoder>,
    camera: Option<Box<dyn CaptureDevice>>,
    filter_stage: Option<Box<dyn FilterStage>>,
    preview: Option<PreviewTarget>,
    last_pts: Option<i64>,
    thumbnail: Option<(Option<u64>, u32)>,
}

impl Worker {
    fn run(&mut self, rx: Receiver<Command>) {
        info!("Video worker started");
        while let Ok(command) = rx.recv() {
            trace!("Worker handling {:?}", command);
            let result = match command {
                Command::Prepare(preview) => self.prepare(preview),
                Command::FrameAvailable => self.frame_available(),
                Command::ChangeFilter(filter) => {
                    self.apply_pending_filter();
                    debug!("Filter change to {} queued", filter);
                    Ok(())
                }
                Command::StartRecording => self.start_recording(),
                Command::StopRecording => {
                    self.stop_recording();
                    break;
                }
                Command::SetCaptureDevice(id) => self.set_capture_device(id),
                Command::AdjustBitrate(bitrate) => match self.encoder.as_mut() {
                    Some(encoder) => encoder.adjust_bitrate(bitrate),
                    None => Err(LivecastError::invalid_state("adjust_bitrate", "no encoder")),
                },
                Command::RequestThumbnail { on_frame, scale } => {
                    self.thumbnail = Some((on_frame, scale));
                    Ok(())
                }
                Command::Quit => {
                    debug!("Video worker quitting");
                    self.release_all();
                    break;
                }
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    error!("Video worker failed: {}", e);
                    self.events.emit(SessionEvent::error(&e));
                    self.shared.set_readiness(Readiness::Failed(e.to_string()));
                    self.release_all();
                    break;
                }
                warn!("Video worker: {}", e);
            }
        }
        self.shared.recording.store(false, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        drop(self.shared.readiness.lock());
        self.shared.readiness_changed.notify_all();
        info!("Video worker exited");
    }

    fn prepare(&mut self, preview: Option<PreviewTarget>) -> Result<()> {
        if preview.is_some() {
            self.preview = preview;
        }
        if self.camera.is_some() {
            debug!("Prepare on a prepared worker only replaces the preview");
            return Ok(());
        }

        if self.encoder.is_none() {
            self.encoder = Some(VideoEncoder::create(
                self.platform.as_ref(),
                &self.video,
                self.muxer.clone(),
            )?);
        }
        if self.filter_stage.is_none() {
            let mut stage = self
                .platform
                .create_filter_stage(self.video.width, self.video.height)?;
            let filter = Filter::from_id(self.shared.filter.load(Ordering::SeqCst)).unwrap_or_default();
            stage.set_filter(filter);
            self.filter_stage = Some(stage);
        }
        self.open_camera(CameraId(self.shared.camera.load(Ordering::SeqCst)))?;

        self.shared.set_readiness(Readiness::Ready);
        info!("Capture pipeline ready on {}", self.platform.name());
        Ok(())
    }

    fn open_camera(&mut self, id: CameraId) -> Result<()> {
        let mut camera = self.platform.open_camera(id, &self.video)?;
        if let Err(e) = camera.start_preview(self.notifier.clone()) {
            camera.close();
            return Err(e);
        }
        self.shared.camera.store(id.0, Ordering::SeqCst);
        self.camera = Some(camera);
        Ok(())
    }

    fn apply_pending_filter(&mut self) {
        let Some(stage) = self.filter_stage.as_mut() else {
            return;
        };
        let pending = self
            .shared
            .pending_filter
            .swap(NO_FILTER_CHANGE, Ordering::SeqCst);
        if pending == NO_FILTER_CHANGE {
            return;
        }
        if let Some(filter) = Filter::from_id(pending) {
            stage.set_filter(filter);
            self.shared.filter.store(pending, Ordering::SeqCst);
        }
    }

    fn frame_available(&mut self) -> Result<()> {
        if *self.shared.readiness.lock() != Readiness::Ready {
            self.shared.frames_dropped.fetch_add(1, Ordering::SeqCst);
            debug!("Frame before the pipeline is ready, dropped");
            return Ok(());
        }
        let frame = match self.camera.as_mut() {
            Some(camera) => camera.acquire_frame()?,
            None => None,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        self.apply_pending_filter();
        let (Some(stage), Some(encoder)) = (self.filter_stage.as_mut(), self.encoder.as_mut()) else {
            return Ok(());
        };
        stage.render(&frame, encoder.input_surface())?;

        if self.shared.recording.load(Ordering::SeqCst) {
            let elapsed = self.clock.elapsed_us(Instant::now());
            let pts = match self.last_pts {
                Some(last) => elapsed.max(last + 1),
                None => elapsed,
            };
            self.last_pts = Some(pts);
            encoder.submit_frame(pts)?;
            encoder.drain(false)?;
            if let Some(track) = encoder.track_index() {
                self.shared.video_track.store(track.0, Ordering::SeqCst);
            }
        }
        let processed = self.shared.frames_processed.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(preview) = &self.preview {
            preview.request_render(encoder.surface());
        }

        if let Some((on_frame, scale)) = self.thumbnail {
            if on_frame.is_none_or(|n| processed >= n) {
                self.thumbnail = None;
                match write_thumbnail(encoder.surface(), &self.output_dir, scale) {
                    Ok(path) => self.events.emit(SessionEvent::ThumbnailWritten { path }),
                    Err(e) => warn!("Thumbnail failed: {}", e),
                }
            }
        }
        Ok(())
    }

    fn start_recording(&mut self) -> Result<()> {
        if *self.shared.readiness.lock() != Readiness::Ready {
            return Err(LivecastError::invalid_state("start_recording", "not ready"));
        }
        self.shared.frames_processed.store(0, Ordering::SeqCst);
        self.last_pts = None;
        self.shared.recording.store(true, Ordering::SeqCst);
        info!("Video recording started");
        Ok(())
    }

    fn stop_recording(&mut self) {
        if self.shared.recording.swap(false, Ordering::SeqCst) {
            if let Some(encoder) = self.encoder.as_mut() {
                match encoder.drain(true) {
                    Ok(_) => info!(
                        "Video drained: {} samples written",
                        encoder.stats().samples_written
                    ),
                    Err(e) => {
                        error!("Final video drain failed: {}", e);
                        self.events.emit(SessionEvent::error(&e));
                    }
                }
                if let Some(track) = encoder.track_index() {
                    self.shared.video_track.store(track.0, Ordering::SeqCst);
                }
            }
        }
        self.release_all();
    }

    fn set_capture_device(&mut self, id: CameraId) -> Result<()> {
        let current = CameraId(self.shared.camera.load(Ordering::SeqCst));
        if self.camera.is_none() {
            // takes effect at prepare
            self.shared.camera.store(id.0, Ordering::SeqCst);
            return Ok(());
        }
        if id == current {
            return Ok(());
        }

        info!("Switching capture device {} -> {}", current, id);
        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
        if let Err(e) = self.open_camera(id) {
            error!("Failed to open {}: {}", id, e);
            self.events.emit(SessionEvent::error(&e));
            // fall back to the previous device
            return self.open_camera(current);
        }
        Ok(())
    }

    fn release_all(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
        if let Some(mut stage) = self.filter_stage.take() {
            stage.release();
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.release();
        }
        self.preview = None;
        debug!("Video worker resources released");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.release_all();
    }
}
