//! Platform factory for hardware resources
//!
//! Every capture device, codec and container the pipeline uses comes from a
//! [`Platform`]. Hosts inject one into the session controller; tests inject
//! a scripted mock.

use std::path::Path;

use crate::capture::{CaptureDevice, FilterStage, Microphone};
use crate::config::{AudioEncoderConfig, VideoEncoderConfig};
use crate::encode::{AudioCodec, VideoCodec};
use crate::error::{LivecastError, Result};
use crate::mux::ContainerWriter;
use crate::types::CameraId;

pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    /// Number of selectable capture devices
    fn camera_count(&self) -> u32;

    /// Open a capture device producing frames at the encoder resolution
    fn open_camera(&self, id: CameraId, config: &VideoEncoderConfig) -> Result<Box<dyn CaptureDevice>>;

    fn open_microphone(&self, config: &AudioEncoderConfig) -> Result<Box<dyn Microphone>>;

    /// Filter stage rendering into a `width`x`height` encoder surface
    fn create_filter_stage(&self, width: u32, height: u32) -> Result<Box<dyn FilterStage>>;

    fn create_video_codec(&self, config: &VideoEncoderConfig) -> Result<Box<dyn VideoCodec>>;

    fn create_audio_codec(&self, config: &AudioEncoderConfig) -> Result<Box<dyn AudioCodec>>;

    /// Platform multiplexer for the direct-container strategy
    fn create_container(&self, path: &Path) -> Result<Box<dyn ContainerWriter>> {
        Err(LivecastError::Unsupported(format!(
            "{} has no container writer for {}",
            self.name(),
            path.display()
        )))
    }
}

#[cfg(feature = "ffmpeg")]
pub use software::SoftwarePlatform;

#[cfg(feature = "ffmpeg")]
mod software {
    use super::*;
    use crate::capture::{SoftwareFilterStage, TestPatternCamera, ToneMicrophone};
    use crate::encode::{FfmpegAudioCodec, FfmpegVideoCodec};
    use crate::mux::FfmpegContainerWriter;

    /// Synthetic sources with FFmpeg codecs
    ///
    /// Needs no capture hardware; the video codec still prefers NVENC when
    /// the driver provides it.
    #[derive(Debug, Clone)]
    pub struct SoftwarePlatform {
        cameras: u32,
    }

    impl Default for SoftwarePlatform {
        fn default() -> Self {
            Self { cameras: 2 }
        }
    }

    impl SoftwarePlatform {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Platform for SoftwarePlatform {
        fn name(&self) -> &str {
            "software"
        }

        fn camera_count(&self) -> u32 {
            self.cameras
        }

        fn open_camera(
            &self,
            id: CameraId,
            config: &VideoEncoderConfig,
        ) -> Result<Box<dyn CaptureDevice>> {
            if id.0 >= self.cameras {
                return Err(LivecastError::hardware(format!("No capture device {}", id)));
            }
            Ok(Box::new(TestPatternCamera::new(
                id,
                config.width,
                config.height,
                config.frame_rate,
            )))
        }

        fn open_microphone(&self, config: &AudioEncoderConfig) -> Result<Box<dyn Microphone>> {
            Ok(Box::new(ToneMicrophone::new(config.sample_rate, config.channels, 440.0)))
        }

        fn create_filter_stage(&self, width: u32, height: u32) -> Result<Box<dyn FilterStage>> {
            Ok(Box::new(SoftwareFilterStage::new(width, height)))
        }

        fn create_video_codec(&self, config: &VideoEncoderConfig) -> Result<Box<dyn VideoCodec>> {
            Ok(Box::new(FfmpegVideoCodec::new(config)?))
        }

        fn create_audio_codec(&self, config: &AudioEncoderConfig) -> Result<Box<dyn AudioCodec>> {
            Ok(Box::new(FfmpegAudioCodec::new(config)?))
        }

        fn create_container(&self, path: &Path) -> Result<Box<dyn ContainerWriter>> {
            Ok(Box::new(FfmpegContainerWriter::create(path)?))
        }
    }
}
