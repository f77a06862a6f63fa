//! Configuration types for livecast
//!
//! A [`Session`] fixes the encode parameters, output layout and upload policy
//! of one recording. It is built once by [`SessionBuilder`] before preparing;
//! only the camera and filter may change while recording.

mod file;

pub use file::{sample_config, AudioSettings, ConfigFile, OutputSettings, UploadSettings, VideoSettings};

use crate::error::{LivecastError, Result};
use crate::mux::adts;
use crate::types::{CameraId, Filter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Samples per channel in one AAC frame
pub const AUDIO_SAMPLES_PER_FRAME: usize = 1024;

/// Floor for adaptive bitrate reduction
pub const MIN_ADAPTIVE_BITRATE: u32 = 300_000;

/// How encoded output is packaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxerStrategy {
    /// Single MP4 through the platform multiplexer
    DirectContainer,
    /// HLS playlist plus MPEG-TS segments
    SegmentedStream,
}

impl MuxerStrategy {
    /// Infer the strategy from an output file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("m3u8") => Ok(Self::SegmentedStream),
            Some("mp4") => Ok(Self::DirectContainer),
            Some(other) => Err(LivecastError::config(format!(
                "Unsupported output extension .{} (expected .m3u8 or .mp4)",
                other
            ))),
            None => Err(LivecastError::config(format!(
                "Output path {:?} has no extension",
                path
            ))),
        }
    }
}

impl std::fmt::Display for MuxerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectContainer => write!(f, "direct-container"),
            Self::SegmentedStream => write!(f, "segmented-stream"),
        }
    }
}

/// Upper bound on the H.264 bitrate (bits per second)
pub const MAX_VIDEO_BITRATE: u32 = 200_000_000;

/// Upper bound on the AAC bitrate (bits per second)
pub const MAX_AUDIO_BITRATE: u32 = 512_000;

/// Longest keyframe interval in seconds
pub const MAX_KEYFRAME_INTERVAL: u32 = 60;

/// H.264 encoder parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoEncoderConfig {
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Seconds between keyframes
    pub keyframe_interval: u32,
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            bitrate: 2_000_000,
            frame_rate: 30,
            keyframe_interval: 1,
        }
    }
}

impl VideoEncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(LivecastError::config("Resolution cannot be zero"));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(LivecastError::config(format!(
                "Resolution {}x{} must have even dimensions",
                self.width, self.height
            )));
        }
        if self.width > 7680 || self.height > 4320 {
            return Err(LivecastError::config(format!(
                "Resolution {}x{} exceeds maximum supported (7680x4320)",
                self.width, self.height
            )));
        }
        if self.bitrate == 0 || self.bitrate > MAX_VIDEO_BITRATE {
            return Err(LivecastError::config(format!(
                "Video bitrate {} out of range (1-{})",
                self.bitrate, MAX_VIDEO_BITRATE
            )));
        }
        if self.frame_rate == 0 || self.frame_rate > 240 {
            return Err(LivecastError::config(format!(
                "Frame rate {} out of range (1-240)",
                self.frame_rate
            )));
        }
        if self.keyframe_interval == 0 || self.keyframe_interval > MAX_KEYFRAME_INTERVAL {
            return Err(LivecastError::config(format!(
                "Keyframe interval {} s out of range (1-{})",
                self.keyframe_interval, MAX_KEYFRAME_INTERVAL
            )));
        }
        Ok(())
    }

    /// Frames between keyframes
    pub fn gop_size(&self) -> u32 {
        self.frame_rate.saturating_mul(self.keyframe_interval)
    }
}

/// AAC encoder parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEncoderConfig {
    pub sample_rate: u32,
    pub channels: u32,
    /// Bits per second
    pub bitrate: u32,
}

impl Default for AudioEncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 1,
            bitrate: 96_000,
        }
    }
}

impl AudioEncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if adts::sample_rate_index(self.sample_rate).is_none() {
            return Err(LivecastError::config(format!(
                "Sample rate {} Hz is not an AAC sampling frequency",
                self.sample_rate
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(LivecastError::config(format!(
                "Channel count {} unsupported (1 or 2)",
                self.channels
            )));
        }
        if self.bitrate == 0 || self.bitrate > MAX_AUDIO_BITRATE {
            return Err(LivecastError::config(format!(
                "Audio bitrate {} out of range (1-{})",
                self.bitrate, MAX_AUDIO_BITRATE
            )));
        }
        Ok(())
    }

    /// Duration of one AAC frame in microseconds
    pub fn frame_duration_us(&self) -> i64 {
        (AUDIO_SAMPLES_PER_FRAME as i64 * 1_000_000) / self.sample_rate as i64
    }
}

/// Uploader policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// How long the uploader waits for the next task before giving up.
    /// `None` waits for the terminal task or an explicit shutdown.
    pub idle_timeout: Option<Duration>,
    /// Remote key prefix; the session id when unset
    pub key_prefix: Option<String>,
}

impl UploadConfig {
    /// Default policy: time out after two segment durations
    pub fn for_segment_duration(segment_duration: Duration) -> Self {
        Self {
            idle_timeout: Some(segment_duration * 2),
            key_prefix: None,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

/// One recording's frozen parameters
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    /// Expanded output file (`<parent>/<id>/<name>`)
    pub output_path: PathBuf,
    pub video: VideoEncoderConfig,
    pub audio: AudioEncoderConfig,
    pub muxer: MuxerStrategy,
    pub segment_duration: Duration,
    /// Entries kept in the live playlist window
    pub playlist_size: usize,
    pub adaptive_bitrate: bool,
    /// Initial capture device
    pub camera: CameraId,
    /// Initial filter
    pub filter: Filter,
    pub upload: UploadConfig,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl Session {
    pub fn builder(output: impl Into<PathBuf>) -> SessionBuilder {
        SessionBuilder::new(output)
    }

    /// Directory holding every file this session writes
    pub fn output_dir(&self) -> &Path {
        self.output_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Output file name without extension (`index` for `index.m3u8`)
    pub fn output_stem(&self) -> &str {
        self.output_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("index")
    }

    /// Remote key prefix for uploads
    pub fn key_prefix(&self) -> String {
        self.upload
            .key_prefix
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Combined configured bitrate of both tracks
    pub fn total_bitrate(&self) -> u32 {
        self.video.bitrate.saturating_add(self.audio.bitrate)
    }
}

/// Builds a [`Session`], expanding the output path with a fresh id
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    output: PathBuf,
    video: VideoEncoderConfig,
    audio: AudioEncoderConfig,
    segment_duration: Duration,
    playlist_size: usize,
    adaptive_bitrate: bool,
    camera: CameraId,
    filter: Filter,
    upload: Option<UploadConfig>,
    title: Option<String>,
    description: Option<String>,
}

impl SessionBuilder {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            video: VideoEncoderConfig::default(),
            audio: AudioEncoderConfig::default(),
            segment_duration: Duration::from_secs(10),
            playlist_size: 5,
            adaptive_bitrate: false,
            camera: CameraId::default(),
            filter: Filter::None,
            upload: None,
            title: None,
            description: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.video.width = width;
        self.video.height = height;
        self
    }

    pub fn with_video_bitrate(mut self, bitrate: u32) -> Self {
        self.video.bitrate = bitrate;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.video.frame_rate = frame_rate;
        self
    }

    pub fn with_keyframe_interval(mut self, seconds: u32) -> Self {
        self.video.keyframe_interval = seconds;
        self
    }

    pub fn with_video(mut self, video: VideoEncoderConfig) -> Self {
        self.video = video;
        self
    }

    pub fn with_audio(mut self, audio: AudioEncoderConfig) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_audio_bitrate(mut self, bitrate: u32) -> Self {
        self.audio.bitrate = bitrate;
        self
    }

    pub fn with_segment_duration(mut self, duration: Duration) -> Self {
        self.segment_duration = duration;
        self
    }

    pub fn with_playlist_size(mut self, entries: usize) -> Self {
        self.playlist_size = entries;
        self
    }

    pub fn with_adaptive_bitrate(mut self, enabled: bool) -> Self {
        self.adaptive_bitrate = enabled;
        self
    }

    pub fn with_camera(mut self, camera: CameraId) -> Self {
        self.camera = camera;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_upload(mut self, upload: UploadConfig) -> Self {
        self.upload = Some(upload);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validate, expand the output path and create the session directory
    pub fn build(self) -> Result<Session> {
        let muxer = MuxerStrategy::from_path(&self.output)?;
        self.video.validate()?;
        self.audio.validate()?;
        if self.segment_duration.is_zero() {
            return Err(LivecastError::config("Segment duration cannot be zero"));
        }
        if self.playlist_size == 0 {
            return Err(LivecastError::config("Playlist window cannot be empty"));
        }

        let file_name = self
            .output
            .file_name()
            .ok_or_else(|| LivecastError::config("Output path has no file name"))?
            .to_owned();
        let parent = self
            .output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let id = Uuid::new_v4();
        let dir = parent.join(id.to_string());
        std::fs::create_dir_all(&dir).map_err(|e| {
            LivecastError::config(format!("Failed to create output directory {:?}: {}", dir, e))
        })?;
        let output_path = dir.join(file_name);
        debug!("Session {} writes {} to {:?}", id, muxer, output_path);

        let upload = self
            .upload
            .unwrap_or_else(|| UploadConfig::for_segment_duration(self.segment_duration));

        Ok(Session {
            id,
            output_path,
            video: self.video,
            audio: self.audio,
            muxer,
            segment_duration: self.segment_duration,
            playlist_size: self.playlist_size,
            adaptive_bitrate: self.adaptive_bitrate,
            camera: self.camera,
            filter: self.filter,
            upload,
            title: self.title,
            description: self.description,
        })
    }
}
