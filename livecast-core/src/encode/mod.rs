//! Video and audio encoding
//!
//! This module provides:
//! - The hardware codec seams ([`HardwareCodec`], [`VideoCodec`], [`AudioCodec`])
//! - [`VideoEncoder`] / [`AudioEncoder`], which own one codec each and drain
//!   its output into the shared muxer
//! - FFmpeg-backed codecs behind the `ffmpeg` feature

mod audio;
mod drain;
#[cfg(feature = "ffmpeg")]
mod ffmpeg_codec;
mod video;

pub use audio::{AudioClock, AudioEncoder};
pub use drain::{DrainStats, DEQUEUE_TIMEOUT, MAX_END_OF_STREAM_POLLS};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_codec::{available_video_encoders, FfmpegAudioCodec, FfmpegVideoCodec};
pub use video::VideoEncoder;

use std::time::Duration;

use crate::error::Result;
use crate::types::{BufferInfo, TrackFormat, VideoSurface};

/// Result of one bounded dequeue on a codec's output side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecOutput {
    /// Nothing available within the timeout
    TryAgainLater,
    /// Output format is known; reported once, before the first data buffer
    FormatChanged(TrackFormat),
    /// Output buffer `index` holds data described by `info`
    Buffer { index: usize, info: BufferInfo },
}

/// A hardware codec instance
///
/// Codecs hold scarce device resources: owners call [`release`](Self::release)
/// on every exit path, and implementations release again on drop if needed.
pub trait HardwareCodec: Send {
    /// Codec name for logs (`h264_nvenc`, `aac`, ...)
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the next output event
    fn dequeue_output(&mut self, timeout: Duration) -> Result<CodecOutput>;

    /// Contents of a dequeued output buffer
    fn output_data(&self, index: usize) -> Result<&[u8]>;

    /// Hand a dequeued output buffer back to the codec
    fn release_output(&mut self, index: usize) -> Result<()>;

    /// Change the target bitrate while running
    fn set_bitrate(&mut self, bitrate: u32) -> Result<()>;

    fn release(&mut self);
}

/// Video codec fed from an input surface
pub trait VideoCodec: HardwareCodec {
    /// Encode the surface contents at `pts_us`
    fn submit(&mut self, surface: &VideoSurface, pts_us: i64) -> Result<()>;

    /// No more input; the codec flushes and ends with an end-of-stream buffer
    fn signal_end_of_input(&mut self) -> Result<()>;
}

/// Audio codec fed interleaved 16-bit PCM
pub trait AudioCodec: HardwareCodec {
    fn queue_input(&mut self, pcm: &[i16], pts_us: i64, end_of_stream: bool) -> Result<()>;
}
