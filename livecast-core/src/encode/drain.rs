//! Draining codec output into the shared muxer
//!
//! Both encoders run the same loop, from different threads. Every muxer call
//! takes the muxer lock for that call only.

use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{CodecOutput, HardwareCodec};
use crate::error::{LivecastError, Result};
use crate::mux::SharedMuxer;
use crate::types::{BufferInfo, TrackIndex, TrackType};

/// Bounded wait on each codec dequeue
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_micros(1000);

/// Empty polls tolerated while waiting for end of stream
pub const MAX_END_OF_STREAM_POLLS: u32 = 2_000;

/// Per-track drain bookkeeping
#[derive(Debug, Clone, Default)]
pub struct DrainStats {
    pub track: Option<TrackIndex>,
    pub samples_written: u64,
    /// Samples released before the muxer had started
    pub dropped_before_start: u64,
    pub end_of_stream: bool,
}

/// Pull everything the codec has ready.
///
/// Returns `Ok(true)` once the codec's end-of-stream buffer was seen. With
/// `end_of_stream` set the loop keeps polling until then.
pub(crate) fn drain<C: HardwareCodec + ?Sized>(
    codec: &mut C,
    muxer: &SharedMuxer,
    track_type: TrackType,
    stats: &mut DrainStats,
    end_of_stream: bool,
) -> Result<bool> {
    if stats.end_of_stream {
        return Ok(true);
    }

    let mut idle_polls = 0;
    loop {
        match codec.dequeue_output(DEQUEUE_TIMEOUT)? {
            CodecOutput::TryAgainLater => {
                if !end_of_stream {
                    return Ok(false);
                }
                idle_polls += 1;
                if idle_polls >= MAX_END_OF_STREAM_POLLS {
                    return Err(LivecastError::encoder(format!(
                        "{} did not reach end of stream",
                        codec.name()
                    )));
                }
            }
            CodecOutput::FormatChanged(format) => {
                if let Some(track) = stats.track {
                    return Err(LivecastError::protocol(format!(
                        "{} output format changed again ({} already registered)",
                        codec.name(),
                        track
                    )));
                }
                if format.track_type != track_type {
                    return Err(LivecastError::encoder(format!(
                        "{} reported a {} format on the {} encoder",
                        codec.name(),
                        format.track_type,
                        track_type
                    )));
                }
                let track = muxer.lock().add_track(&format)?;
                info!("{} output format {} -> {}", codec.name(), format, track);
                stats.track = Some(track);
            }
            CodecOutput::Buffer { index, info } => {
                idle_polls = 0;
                let written = write_buffer(codec, index, &info, muxer, stats);
                codec.release_output(index)?;
                written?;

                if info.flags.is_end_of_stream() {
                    if end_of_stream {
                        debug!("{} reached end of stream", codec.name());
                    } else {
                        warn!("{} ended its stream unexpectedly", codec.name());
                    }
                    stats.end_of_stream = true;
                    return Ok(true);
                }
            }
        }
    }
}

fn write_buffer<C: HardwareCodec + ?Sized>(
    codec: &C,
    index: usize,
    info: &BufferInfo,
    muxer: &SharedMuxer,
    stats: &mut DrainStats,
) -> Result<()> {
    let track = stats.track.ok_or_else(|| {
        LivecastError::protocol(format!("{} produced data before its format", codec.name()))
    })?;
    let data = codec.output_data(index)?;
    let payload = data
        .get(info.offset..info.offset + info.size)
        .ok_or_else(|| {
            LivecastError::encoder(format!(
                "{} buffer {} range {}+{} exceeds {} bytes",
                codec.name(),
                index,
                info.offset,
                info.size,
                data.len()
            ))
        })?;

    let mut muxer = muxer.lock();
    if !muxer.is_started() {
        stats.dropped_before_start += 1;
        trace!(
            "Muxer not started, dropping {} byte sample from {}",
            info.size,
            track
        );
        return Ok(());
    }
    muxer.write_sample(track, payload, info)?;
    stats.samples_written += 1;
    trace!(
        "{} wrote {} bytes at {} us (flags {:#x})",
        track,
        info.size,
        info.presentation_time_us,
        info.flags.bits()
    );
    Ok(())
}
