//! Capture sources and the encoder worker threads
//!
//! This module handles:
//! - Capture device, microphone and preview seams
//! - [`FrameSource`]: the video worker thread owning camera, filter stage
//!   and video encoder, driven through a command mailbox
//! - [`AudioSource`]: the microphone thread feeding the audio encoder
//! - Thumbnails taken from the encoder surface

mod audio_source;
mod filter;
mod frame_source;
mod synthetic;
mod thumbnail;

pub use audio_source::AudioSource;
pub use filter::{FilterStage, SoftwareFilterStage};
pub use frame_source::{Command, FrameNotifier, FrameSource, RecordingClock};
pub use synthetic::{TestPatternCamera, ToneMicrophone};
pub use thumbnail::write_thumbnail;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{CameraId, CaptureFrame, VideoSurface};

/// A camera or other frame producer
pub trait CaptureDevice: Send {
    fn id(&self) -> CameraId;

    /// Begin producing frames; `notifier` fires once per new frame
    fn start_preview(&mut self, notifier: FrameNotifier) -> Result<()>;

    /// The newest frame, if one arrived since the last call
    fn acquire_frame(&mut self) -> Result<Option<CaptureFrame>>;

    /// Stop producing frames and give the device back
    fn close(&mut self);
}

/// Microphone delivering interleaved 16-bit PCM
pub trait Microphone: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u32;

    /// Fill `buf`, waiting at most `timeout`; returns the number of
    /// interleaved samples written
    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize>;

    fn close(&mut self);
}

/// Host-side preview the worker asks to redraw after each frame
pub trait PreviewSink: Send + Sync {
    fn request_render(&self, surface: &VideoSurface);
}

pub type PreviewTarget = Arc<dyn PreviewSink>;
