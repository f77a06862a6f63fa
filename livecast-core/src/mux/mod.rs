//! Muxers: turn encoder output into container files
//!
//! Two strategies share one call protocol (see [`Muxer`]):
//! - [`DirectContainerMuxer`] hands samples to a platform [`ContainerWriter`] (MP4)
//! - [`SegmentedStreamMuxer`] frames samples itself and cuts an HLS stream
//!   into MPEG-TS segments
//!
//! The muxer is the one object both encoder threads touch, so it lives
//! behind a [`SharedMuxer`] lock.

pub mod adts;
mod container;
pub mod hls;
pub mod mpegts;
mod segmented;

pub use container::{ContainerWriter, DirectContainerMuxer};
#[cfg(feature = "ffmpeg")]
pub use container::FfmpegContainerWriter;
pub use hls::{HlsSegmenter, MediaPlaylist, PlaylistEntry};
pub use segmented::{FramedPacket, PacketSink, SegmentedStreamMuxer};

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

use crate::config::{MuxerStrategy, Session};
use crate::error::{LivecastError, Result};
use crate::platform::Platform;
use crate::types::{BufferInfo, TrackFormat, TrackIndex};

/// Tracks a recording session muxes (video + audio)
pub const SESSION_TRACKS: usize = 2;

/// Container multiplexer contract
///
/// Calls must follow `add_track* -> start -> write_sample* -> stop -> release`.
/// `start` fires by itself once the expected number of tracks is registered.
pub trait Muxer: Send {
    /// Register a track; each track type can be registered once
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackIndex>;

    /// Begin writing; a no-op when already started
    fn start(&mut self) -> Result<()>;

    fn is_started(&self) -> bool;

    /// Write one sample; `data` is exactly the sample payload.
    /// An end-of-stream flag marks the track finished.
    fn write_sample(&mut self, track: TrackIndex, data: &[u8], info: &BufferInfo) -> Result<()>;

    /// Flush and finalize the container; idempotent
    fn stop(&mut self) -> Result<()>;

    /// Drop container resources
    fn release(&mut self);

    /// Whether every track has signalled end of stream
    fn is_finished(&self) -> bool;

    fn output_path(&self) -> &Path;
}

/// A muxer shared by the video worker and the audio thread
pub type SharedMuxer = Arc<Mutex<Box<dyn Muxer>>>;

/// Wrap a muxer for sharing between encoder threads
pub fn shared(muxer: impl Muxer + 'static) -> SharedMuxer {
    Arc::new(Mutex::new(Box::new(muxer)))
}

/// Build the muxer a session asks for
pub fn create_muxer(session: &Session, platform: &dyn Platform) -> Result<SharedMuxer> {
    match session.muxer {
        MuxerStrategy::SegmentedStream => Ok(shared(SegmentedStreamMuxer::new(session)?)),
        MuxerStrategy::DirectContainer => {
            let writer = platform.create_container(&session.output_path)?;
            Ok(shared(DirectContainerMuxer::new(
                session.output_path.clone(),
                writer,
                SESSION_TRACKS,
            )))
        }
    }
}

/// Muxer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerState {
    Configuring,
    Started,
    Stopped,
    Released,
}

impl std::fmt::Display for MuxerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MuxerState::Configuring => "configuring",
            MuxerState::Started => "started",
            MuxerState::Stopped => "stopped",
            MuxerState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Track bookkeeping and call-order enforcement shared by both strategies.
///
/// Track slots are fixed per track type: video is index 0, audio index 1.
#[derive(Debug)]
pub struct TrackTable {
    expected: usize,
    slots: [Option<TrackFormat>; SESSION_TRACKS],
    finished: [bool; SESSION_TRACKS],
    state: MuxerState,
}

impl TrackTable {
    pub fn new(expected: usize) -> Self {
        Self {
            expected: expected.clamp(1, SESSION_TRACKS),
            slots: [None, None],
            finished: [false; SESSION_TRACKS],
            state: MuxerState::Configuring,
        }
    }

    pub fn state(&self) -> MuxerState {
        self.state
    }

    pub fn registered(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether every expected track is registered
    pub fn is_complete(&self) -> bool {
        self.registered() >= self.expected
    }

    pub fn register(&mut self, format: &TrackFormat) -> Result<TrackIndex> {
        if self.state != MuxerState::Configuring {
            return Err(LivecastError::protocol(format!(
                "add_track({}) while muxer is {}",
                format.track_type, self.state
            )));
        }
        let slot = format.track_type.slot();
        if self.slots[slot].is_some() {
            return Err(LivecastError::protocol(format!(
                "{} track already registered at index {}",
                format.track_type, slot
            )));
        }
        if self.is_complete() {
            return Err(LivecastError::protocol(format!(
                "muxer expects {} track(s), cannot add {}",
                self.expected, format.track_type
            )));
        }
        self.slots[slot] = Some(format.clone());
        Ok(TrackIndex(slot))
    }

    /// Move to Started; `Ok(false)` when already started
    pub fn start(&mut self) -> Result<bool> {
        match self.state {
            MuxerState::Configuring if self.registered() > 0 => {
                self.state = MuxerState::Started;
                Ok(true)
            }
            MuxerState::Configuring => Err(LivecastError::protocol("start() with no tracks")),
            MuxerState::Started => Ok(false),
            state => Err(LivecastError::protocol(format!("start() while muxer is {}", state))),
        }
    }

    /// Format of a track that may be written now
    pub fn check_writable(&self, track: TrackIndex) -> Result<&TrackFormat> {
        if self.state != MuxerState::Started {
            return Err(LivecastError::protocol(format!(
                "write_sample({}) while muxer is {}",
                track, self.state
            )));
        }
        self.format(track)
            .ok_or_else(|| LivecastError::protocol(format!("write_sample to unknown {}", track)))
    }

    pub fn format(&self, track: TrackIndex) -> Option<&TrackFormat> {
        self.slots.get(track.0).and_then(|s| s.as_ref())
    }

    /// Mark a track's end of stream; true once every registered track is done
    pub fn finish_track(&mut self, track: TrackIndex) -> bool {
        if let Some(done) = self.finished.get_mut(track.0) {
            *done = true;
        }
        self.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.is_complete()
            && self
                .slots
                .iter()
                .zip(self.finished.iter())
                .all(|(slot, done)| slot.is_none() || *done)
    }

    /// Move to Stopped; true when the muxer had started
    pub fn stop(&mut self) -> bool {
        let was_started = self.state == MuxerState::Started;
        if matches!(self.state, MuxerState::Configuring | MuxerState::Started) {
            self.state = MuxerState::Stopped;
        }
        was_started
    }

    pub fn release(&mut self) {
        self.state = MuxerState::Released;
    }
}
