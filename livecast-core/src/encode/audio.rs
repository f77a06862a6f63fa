//! Audio encoder wrapper and sample-count timestamps

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::drain::{drain, DrainStats};
use super::AudioCodec;
use crate::config::{AudioEncoderConfig, AUDIO_SAMPLES_PER_FRAME};
use crate::error::Result;
use crate::mux::SharedMuxer;
use crate::platform::Platform;
use crate::types::{TrackIndex, TrackType};

/// Owns one audio codec
pub struct AudioEncoder {
    codec: Box<dyn AudioCodec>,
    muxer: SharedMuxer,
    config: AudioEncoderConfig,
    stats: DrainStats,
    input_ended: bool,
    released: bool,
}

impl AudioEncoder {
    /// Validate `config` and acquire a codec from the platform; nothing is
    /// retained on failure
    pub fn create(
        platform: &dyn Platform,
        config: &AudioEncoderConfig,
        muxer: SharedMuxer,
    ) -> Result<Self> {
        config.validate()?;
        let codec = platform.create_audio_codec(config)?;
        Ok(Self::with_codec(codec, config, muxer))
    }

    pub fn with_codec(
        codec: Box<dyn AudioCodec>,
        config: &AudioEncoderConfig,
        muxer: SharedMuxer,
    ) -> Self {
        info!(
            "Audio encoder {}: {}ch @ {}Hz, {} kbps",
            codec.name(),
            config.channels,
            config.sample_rate,
            config.bitrate / 1000
        );
        Self {
            codec,
            muxer,
            config: *config,
            stats: DrainStats::default(),
            input_ended: false,
            released: false,
        }
    }

    /// Queue interleaved PCM and drain; the final call passes `end_of_stream`
    /// and returns once the codec's last buffer is written
    pub fn encode(&mut self, pcm: &[i16], pts_us: i64, end_of_stream: bool) -> Result<bool> {
        if !self.input_ended {
            self.codec.queue_input(pcm, pts_us, end_of_stream)?;
            self.input_ended = end_of_stream;
        }
        self.drain(end_of_stream)
    }

    pub fn drain(&mut self, end_of_stream: bool) -> Result<bool> {
        drain(
            self.codec.as_mut(),
            &self.muxer,
            TrackType::Audio,
            &mut self.stats,
            end_of_stream,
        )
    }

    pub fn config(&self) -> &AudioEncoderConfig {
        &self.config
    }

    pub fn track_index(&self) -> Option<TrackIndex> {
        self.stats.track
    }

    pub fn stats(&self) -> &DrainStats {
        &self.stats
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.codec.release();
        if self.stats.dropped_before_start > 0 {
            warn!(
                "{} audio samples were produced before the muxer started",
                self.stats.dropped_before_start
            );
        }
        debug!("Audio encoder released after {} samples", self.stats.samples_written);
    }
}

impl Drop for AudioEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

/// Audio presentation times derived from the number of samples read.
///
/// Reads from a microphone arrive in bursts; stamping them with the wall
/// clock makes timestamps jitter. The clock advances by exactly one buffer
/// per read and re-anchors to the wall clock only when the two drift apart
/// by more than two AAC frames.
#[derive(Debug, Clone)]
pub struct AudioClock {
    sample_rate: u32,
    anchor_us: i64,
    samples_since_anchor: u64,
    max_drift_us: i64,
    reanchors: u64,
}

impl AudioClock {
    pub fn new(sample_rate: u32) -> Self {
        let frame_us = (AUDIO_SAMPLES_PER_FRAME as i64 * 1_000_000) / sample_rate.max(1) as i64;
        Self {
            sample_rate: sample_rate.max(1),
            anchor_us: 0,
            samples_since_anchor: 0,
            max_drift_us: frame_us * 2,
            reanchors: 0,
        }
    }

    /// Timestamp for a buffer of `samples` (per channel) whose last sample
    /// was read `elapsed` after the recording origin
    pub fn next_pts(&mut self, elapsed: Duration, samples: usize) -> i64 {
        let buffer_us = (samples as i64 * 1_000_000) / self.sample_rate as i64;
        let wall_us = (elapsed.as_micros() as i64 - buffer_us).max(0);
        let expected_us = self.anchor_us
            + (self.samples_since_anchor as i64 * 1_000_000) / self.sample_rate as i64;

        let pts = if (wall_us - expected_us).abs() > self.max_drift_us {
            // never step backwards
            let anchored = wall_us.max(expected_us);
            if self.samples_since_anchor > 0 {
                self.reanchors += 1;
                debug!(
                    "Audio clock drifted {} us, re-anchoring",
                    wall_us - expected_us
                );
            }
            self.anchor_us = anchored;
            self.samples_since_anchor = 0;
            anchored
        } else {
            expected_us
        };
        self.samples_since_anchor += samples as u64;
        pts
    }

    /// Times the clock had to re-anchor to the wall clock
    pub fn reanchors(&self) -> u64 {
        self.reanchors
    }

    /// Convenience for callers holding the origin instant
    pub fn next_pts_at(&mut self, origin: Instant, now: Instant, samples: usize) -> i64 {
        self.next_pts(now.saturating_duration_since(origin), samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_ignores_jitter() {
        let mut clock = AudioClock::new(48_000);
        let frame = Duration::from_micros(21_333);
        let mut last = -1;
        for i in 1..=50u32 {
            // +-5 ms of scheduling jitter
            let jitter = if i % 2 == 0 { 5_000 } else { 0 };
            let elapsed = frame * i + Duration::from_micros(jitter);
            let pts = clock.next_pts(elapsed, 1024);
            assert_eq!(pts, (i as i64 - 1) * 1024 * 1_000_000 / 48_000);
            assert!(pts > last);
            last = pts;
        }
        assert_eq!(clock.reanchors(), 0);
    }

    #[test]
    fn test_clock_reanchors_after_gap() {
        let mut clock = AudioClock::new(44_100);
        let frame_us = 1024 * 1_000_000 / 44_100;
        clock.next_pts(Duration::from_micros(frame_us as u64), 1024);
        // microphone stalled for half a second
        let pts = clock.next_pts(Duration::from_micros(frame_us as u64 * 2 + 500_000), 1024);
        assert!(pts >= 500_000);
        assert_eq!(clock.reanchors(), 1);
    }
}
