//! Video encoder wrapper

use tracing::{debug, info, warn};

use super::drain::{drain, DrainStats};
use super::VideoCodec;
use crate::config::{VideoEncoderConfig, MIN_ADAPTIVE_BITRATE};
use crate::error::Result;
use crate::mux::SharedMuxer;
use crate::platform::Platform;
use crate::types::{TrackIndex, TrackType, VideoSurface};

/// Owns one video codec and its input surface
pub struct VideoEncoder {
    codec: Box<dyn VideoCodec>,
    muxer: SharedMuxer,
    config: VideoEncoderConfig,
    surface: VideoSurface,
    bitrate: u32,
    stats: DrainStats,
    input_ended: bool,
    released: bool,
}

impl VideoEncoder {
    /// Validate `config` and acquire a codec from the platform; nothing is
    /// retained on failure
    pub fn create(
        platform: &dyn Platform,
        config: &VideoEncoderConfig,
        muxer: SharedMuxer,
    ) -> Result<Self> {
        config.validate()?;
        let codec = platform.create_video_codec(config)?;
        Ok(Self::with_codec(codec, config, muxer))
    }

    pub fn with_codec(
        codec: Box<dyn VideoCodec>,
        config: &VideoEncoderConfig,
        muxer: SharedMuxer,
    ) -> Self {
        info!(
            "Video encoder {}: {}x{} @ {}fps, {} kbps",
            codec.name(),
            config.width,
            config.height,
            config.frame_rate,
            config.bitrate / 1000
        );
        Self {
            codec,
            muxer,
            config: *config,
            surface: VideoSurface::new(config.width, config.height),
            bitrate: config.bitrate,
            stats: DrainStats::default(),
            input_ended: false,
            released: false,
        }
    }

    /// Surface the filter stage renders the next frame into
    pub fn input_surface(&mut self) -> &mut VideoSurface {
        &mut self.surface
    }

    pub fn surface(&self) -> &VideoSurface {
        &self.surface
    }

    /// Encode the current surface contents
    pub fn submit_frame(&mut self, pts_us: i64) -> Result<()> {
        self.codec.submit(&self.surface, pts_us)
    }

    /// Drain available output; with `end_of_stream` the codec is told input
    /// ended and the call returns once its last buffer is written
    pub fn drain(&mut self, end_of_stream: bool) -> Result<bool> {
        if end_of_stream && !self.input_ended {
            debug!("Signalling end of input to {}", self.codec.name());
            self.codec.signal_end_of_input()?;
            self.input_ended = true;
        }
        drain(
            self.codec.as_mut(),
            &self.muxer,
            TrackType::Video,
            &mut self.stats,
            end_of_stream,
        )
    }

    /// Change the target bitrate, never below the adaptive floor
    pub fn adjust_bitrate(&mut self, bitrate: u32) -> Result<()> {
        let bitrate = bitrate.max(MIN_ADAPTIVE_BITRATE);
        if bitrate == self.bitrate {
            return Ok(());
        }
        self.codec.set_bitrate(bitrate)?;
        info!(
            "Video bitrate {} -> {} kbps",
            self.bitrate / 1000,
            bitrate / 1000
        );
        self.bitrate = bitrate;
        Ok(())
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn config(&self) -> &VideoEncoderConfig {
        &self.config
    }

    pub fn track_index(&self) -> Option<TrackIndex> {
        self.stats.track
    }

    pub fn stats(&self) -> &DrainStats {
        &self.stats
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.codec.release();
        if self.stats.dropped_before_start > 0 {
            warn!(
                "{} video samples were produced before the muxer started",
                self.stats.dropped_before_start
            );
        }
        debug!("Video encoder released after {} samples", self.stats.samples_written);
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        self.release();
    }
}
