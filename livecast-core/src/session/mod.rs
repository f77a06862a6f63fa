//! Recording session state machine
//!
//! [`SessionController`] composes the muxer, the video worker and the audio
//! thread for one [`Session`]:
//!
//! ```text
//! Idle -> Preparing -> Ready -> Recording -> Draining -> Released
//!                                                          |
//!                                reset() <-----------------+
//! ```

mod broadcast;
mod events;

pub use broadcast::{vod_playlist_path, Broadcaster};
pub use events::{EventBus, SessionEvent};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::capture::{AudioSource, FrameSource, PreviewTarget, RecordingClock};
use crate::config::Session;
use crate::error::{LivecastError, Result};
use crate::mux::{create_muxer, SharedMuxer};
use crate::platform::Platform;
use crate::types::{CameraId, EncoderState, Filter, TrackIndex};

/// How long `prepare` waits for the capture pipeline
const PREPARE_TIMEOUT: Duration = Duration::from_secs(10);

struct Inner {
    session: Session,
    state: EncoderState,
    muxer: Option<SharedMuxer>,
    video: Option<FrameSource>,
    audio: Option<AudioSource>,
    preview: Option<PreviewTarget>,
    camera: CameraId,
    filter: Filter,
}

/// Owns one recording at a time
///
/// All methods take `&self`; hosts share the controller behind an `Arc`.
pub struct SessionController {
    platform: Arc<dyn Platform>,
    events: EventBus,
    inner: Mutex<Inner>,
}

impl SessionController {
    pub fn new(platform: Arc<dyn Platform>, session: Session) -> Self {
        Self::with_events(platform, session, EventBus::new())
    }

    pub fn with_events(platform: Arc<dyn Platform>, session: Session, events: EventBus) -> Self {
        info!(
            "Session {} on {}: {}",
            session.id,
            platform.name(),
            session.output_path.display()
        );
        let camera = session.camera;
        let filter = session.filter;
        Self {
            platform,
            events,
            inner: Mutex::new(Inner {
                session,
                state: EncoderState::Idle,
                muxer: None,
                video: None,
                audio: None,
                preview: None,
                camera,
                filter,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> EncoderState {
        self.inner.lock().state
    }

    pub fn session(&self) -> Session {
        self.inner.lock().session.clone()
    }

    fn transition(&self, inner: &mut Inner, to: EncoderState) {
        let from = inner.state;
        if from == to {
            return;
        }
        info!("Session {}: {} -> {}", inner.session.id, from, to);
        inner.state = to;
        self.events.emit(SessionEvent::StateChanged { from, to });
    }

    /// Build encoders and muxer, open the capture device and attach the
    /// preview. Blocks until the pipeline is ready.
    pub fn prepare(&self, preview: Option<PreviewTarget>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != EncoderState::Idle {
            return Err(LivecastError::invalid_state("prepare", inner.state));
        }
        self.transition(&mut inner, EncoderState::Preparing);

        match self.build(&mut inner, preview) {
            Ok(()) => {
                self.transition(&mut inner, EncoderState::Ready);
                Ok(())
            }
            Err(e) => {
                error!("Prepare failed: {}", e);
                self.events.emit(SessionEvent::error(&e));
                self.teardown(&mut inner);
                self.transition(&mut inner, EncoderState::Released);
                Err(e)
            }
        }
    }

    fn build(&self, inner: &mut Inner, preview: Option<PreviewTarget>) -> Result<()> {
        let mut session = inner.session.clone();
        session.camera = inner.camera;
        session.filter = inner.filter;

        let muxer = create_muxer(&session, self.platform.as_ref())?;
        inner.muxer = Some(muxer.clone());

        let clock = RecordingClock::new();
        let video = FrameSource::spawn(
            Arc::clone(&self.platform),
            &session,
            muxer.clone(),
            clock.clone(),
            self.events.clone(),
        )?;
        let video = inner.video.insert(video);
        inner.audio = Some(AudioSource::spawn(
            Arc::clone(&self.platform),
            &session,
            muxer,
            clock,
            self.events.clone(),
        )?);

        if preview.is_some() {
            inner.preview = preview;
        }
        video.prepare(inner.preview.clone())?;
        video.wait_until_ready(PREPARE_TIMEOUT)
    }

    /// Begin recording; the first frame processed becomes time zero
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            EncoderState::Ready => {}
            EncoderState::Recording => return Ok(()),
            state => return Err(LivecastError::invalid_state("start", state)),
        }
        let (Some(video), Some(audio)) = (inner.video.as_ref(), inner.audio.as_ref()) else {
            return Err(LivecastError::invalid_state("start", "no capture sources"));
        };
        video.start_recording()?;
        audio.start();
        self.transition(&mut inner, EncoderState::Recording);
        Ok(())
    }

    /// Flush both encoders, finalize the muxer and release everything.
    /// Calls after the first are no-ops.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            EncoderState::Draining | EncoderState::Released => {
                debug!("stop() while {}, ignored", inner.state);
                return Ok(());
            }
            EncoderState::Idle => return Err(LivecastError::invalid_state("stop", inner.state)),
            EncoderState::Preparing | EncoderState::Ready | EncoderState::Recording => {}
        }
        let was_recording = inner.state == EncoderState::Recording;
        self.transition(&mut inner, EncoderState::Draining);
        if was_recording {
            self.check_tracks(&inner);
        }

        if let Some(video) = inner.video.as_mut() {
            if let Err(e) = video.stop_recording() {
                warn!("Video worker already gone: {}", e);
            }
            video.join();
        }
        if let Some(audio) = inner.audio.as_mut() {
            audio.stop();
            audio.join();
        }

        let mut result = Ok(());
        if let Some(muxer) = inner.muxer.take() {
            let mut muxer = muxer.lock();
            if let Err(e) = muxer.stop() {
                error!("Failed to finalize {}: {}", muxer.output_path().display(), e);
                self.events.emit(SessionEvent::error(&e));
                result = Err(e);
            }
            muxer.release();
        }
        inner.video = None;
        inner.audio = None;

        self.transition(&mut inner, EncoderState::Released);
        self.events.emit(SessionEvent::Stopped);
        result
    }

    /// Rebuild encoders and muxer for another recording, keeping the
    /// platform, preview, camera and filter
    pub fn reset(&self, session: Session) -> Result<()> {
        let preview = {
            let mut inner = self.inner.lock();
            match inner.state {
                EncoderState::Released | EncoderState::Idle => {}
                state => return Err(LivecastError::invalid_state("reset", state)),
            }
            self.teardown(&mut inner);
            info!("Session reset: {}", session.output_path.display());
            inner.session = session;
            self.transition(&mut inner, EncoderState::Idle);
            inner.preview.clone()
        };
        self.prepare(preview)
    }

    /// Select a filter by id; takes effect on the next frame
    pub fn apply_filter(&self, id: u32) -> Result<()> {
        let filter =
            Filter::from_id(id).ok_or_else(|| LivecastError::config(format!("Unknown filter id {}", id)))?;
        let mut inner = self.inner.lock();
        if let Some(video) = inner.video.as_ref() {
            video.change_filter(filter)?;
        }
        inner.filter = filter;
        Ok(())
    }

    pub fn filter(&self) -> Filter {
        let inner = self.inner.lock();
        match inner.video.as_ref() {
            Some(video) => video.filter(),
            None => inner.filter,
        }
    }

    /// Switch capture device; encoder and muxer are untouched
    pub fn set_camera(&self, id: CameraId) -> Result<()> {
        let count = self.platform.camera_count();
        if id.0 >= count {
            return Err(LivecastError::config(format!(
                "{} out of range ({} devices)",
                id, count
            )));
        }
        let mut inner = self.inner.lock();
        if let Some(video) = inner.video.as_ref() {
            video.set_capture_device(id)?;
        }
        inner.camera = id;
        Ok(())
    }

    pub fn camera(&self) -> CameraId {
        self.inner.lock().camera
    }

    pub fn adjust_bitrate(&self, bitrate: u32) -> Result<()> {
        let inner = self.inner.lock();
        match (&inner.video, inner.state) {
            (Some(video), EncoderState::Recording) => video.adjust_bitrate(bitrate),
            (_, state) => Err(LivecastError::invalid_state("adjust_bitrate", state)),
        }
    }

    pub fn request_thumbnail(&self, on_frame: Option<u64>, scale: u32) -> Result<()> {
        let inner = self.inner.lock();
        match inner.video.as_ref() {
            Some(video) => video.request_thumbnail(on_frame, scale),
            None => Err(LivecastError::invalid_state("request_thumbnail", inner.state)),
        }
    }

    /// Frames rendered since recording started
    pub fn frames_processed(&self) -> u64 {
        self.inner
            .lock()
            .video
            .as_ref()
            .map(|v| v.frames_processed())
            .unwrap_or(0)
    }

    pub fn video_track(&self) -> Option<TrackIndex> {
        self.inner.lock().video.as_ref().and_then(|v| v.video_track())
    }

    pub fn audio_track(&self) -> Option<TrackIndex> {
        self.inner.lock().audio.as_ref().and_then(|a| a.audio_track())
    }

    /// The running muxer, while there is one
    pub fn muxer(&self) -> Option<SharedMuxer> {
        self.inner.lock().muxer.clone()
    }

    /// Samples held back for a track that never produced output are lost
    fn check_tracks(&self, inner: &Inner) {
        let missing: Vec<&str> = [
            ("video", inner.video.as_ref().and_then(|v| v.video_track())),
            ("audio", inner.audio.as_ref().and_then(|a| a.audio_track())),
        ]
        .into_iter()
        .filter_map(|(name, track)| track.is_none().then_some(name))
        .collect();
        if missing.is_empty() {
            return;
        }
        let e = LivecastError::invalid_state(
            "finalize",
            format!("no {} output arrived while recording", missing.join(" or ")),
        );
        warn!("{}: {}", inner.session.output_path.display(), e);
        self.events.emit(SessionEvent::error(&e));
    }

    /// Drop sources and muxer without flushing
    fn teardown(&self, inner: &mut Inner) {
        inner.video = None;
        inner.audio = None;
        if let Some(muxer) = inner.muxer.take() {
            muxer.lock().release();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let state = self.inner.get_mut().state;
        if state == EncoderState::Recording {
            if let Err(e) = self.stop() {
                warn!("Stop on drop failed: {}", e);
            }
        } else {
            let inner = self.inner.get_mut();
            inner.video = None;
            inner.audio = None;
            if let Some(muxer) = inner.muxer.take() {
                muxer.lock().release();
            }
        }
    }
}
