//! Configuration file loading and merging
//!
//! Loads user configuration from `~/.config/livecast/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AudioEncoderConfig, SessionBuilder, UploadConfig, VideoEncoderConfig};
use crate::error::{LivecastError, Result};
use crate::types::Filter;

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Video encoder settings
    #[serde(default)]
    pub video: VideoSettings,

    /// Audio encoder settings
    #[serde(default)]
    pub audio: AudioSettings,

    /// Output layout settings
    #[serde(default)]
    pub output: OutputSettings,

    /// Upload settings
    #[serde(default)]
    pub upload: UploadSettings,
}

/// Video encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSettings {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Bitrate in kbps
    #[serde(default = "default_video_bitrate")]
    pub bitrate: u32,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Seconds between keyframes
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
}

/// Audio encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u32,

    /// Bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
}

/// Output layout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Directory recordings go to when no path is given
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Segment duration in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u64,

    /// Entries kept in the live playlist
    #[serde(default = "default_playlist_size")]
    pub playlist_size: usize,

    /// Lower the video bitrate when uploads fall behind
    #[serde(default)]
    pub adaptive_bitrate: bool,

    /// Initial filter (none, black-white, night, invert, mirror)
    #[serde(default = "default_filter")]
    pub filter: String,
}

/// Upload settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Uploader idle timeout in seconds; unset = two segment durations, 0 = wait for the last segment
    #[serde(default)]
    pub idle_timeout: Option<u64>,

    /// Remote key prefix (defaults to the session id)
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Mirror uploads into this directory
    #[serde(default)]
    pub local_dir: Option<PathBuf>,

    /// S3 bucket
    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (MinIO, R2, ...)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Base URL viewers fetch the playlist from
    #[serde(default)]
    pub public_url: Option<String>,
}

// Default value functions
fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_video_bitrate() -> u32 {
    2000
}

fn default_frame_rate() -> u32 {
    30
}

fn default_keyframe_interval() -> u32 {
    1
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_channels() -> u32 {
    1
}

fn default_audio_bitrate() -> u32 {
    96
}

fn default_segment_duration() -> u64 {
    10
}

fn default_playlist_size() -> usize {
    5
}

fn default_filter() -> String {
    "none".to_string()
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            bitrate: default_video_bitrate(),
            frame_rate: default_frame_rate(),
            keyframe_interval: default_keyframe_interval(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bitrate: default_audio_bitrate(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: None,
            segment_duration: default_segment_duration(),
            playlist_size: default_playlist_size(),
            adaptive_bitrate: false,
            filter: default_filter(),
        }
    }
}

impl ConfigFile {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("livecast").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("livecast")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/livecast/config.toml")
        }
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| LivecastError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ConfigFile = toml::from_str(&content)
            .map_err(|e| LivecastError::Config(format!("Failed to parse config file: {}", e)))?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration, logging warnings but returning defaults on error
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LivecastError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| LivecastError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&path, content)
            .map_err(|e| LivecastError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Write the sample config if no file exists yet
    pub fn create_default_if_missing() -> Result<bool> {
        let path = Self::default_path();
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, sample_config())?;
        info!("Created configuration at {:?}", path);
        Ok(true)
    }

    /// Video encoder parameters from the `[video]` section
    pub fn video_config(&self) -> VideoEncoderConfig {
        VideoEncoderConfig {
            width: self.video.width,
            height: self.video.height,
            bitrate: self.video.bitrate.saturating_mul(1000),
            frame_rate: self.video.frame_rate,
            keyframe_interval: self.video.keyframe_interval,
        }
    }

    /// Audio encoder parameters from the `[audio]` section
    pub fn audio_config(&self) -> AudioEncoderConfig {
        AudioEncoderConfig {
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            bitrate: self.audio.bitrate.saturating_mul(1000),
        }
    }

    /// Uploader policy from the `[upload]` section
    pub fn upload_config(&self) -> UploadConfig {
        let segment = Duration::from_secs(self.output.segment_duration);
        let mut upload = UploadConfig::for_segment_duration(segment);
        match self.upload.idle_timeout {
            Some(0) => upload.idle_timeout = None,
            Some(secs) => upload.idle_timeout = Some(Duration::from_secs(secs)),
            None => {}
        }
        upload.key_prefix = self.upload.key_prefix.clone();
        upload
    }

    /// Apply file settings on top of a builder; values set later on the
    /// builder still win
    pub fn apply(&self, builder: SessionBuilder) -> Result<SessionBuilder> {
        let filter: Filter = self
            .output
            .filter
            .parse()
            .map_err(LivecastError::Config)?;
        Ok(builder
            .with_video(self.video_config())
            .with_audio(self.audio_config())
            .with_segment_duration(Duration::from_secs(self.output.segment_duration))
            .with_playlist_size(self.output.playlist_size)
            .with_adaptive_bitrate(self.output.adaptive_bitrate)
            .with_filter(filter)
            .with_upload(self.upload_config()))
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# livecast configuration

[video]
# Encoded resolution (even dimensions)
width = 1280
height = 720

# Bitrate in kbps
bitrate = 2000

frame_rate = 30

# Seconds between keyframes; segments can only cut on a keyframe
keyframe_interval = 1

[audio]
# AAC sample rate in Hz (8000-96000)
sample_rate = 44100

# 1 = mono, 2 = stereo
channels = 1

# Bitrate in kbps
bitrate = 96

[output]
# Where `livecast record` puts recordings when given a bare file name
# directory = "/home/me/Videos/livecast"

# HLS segment duration in seconds
segment_duration = 10

# Segments kept in the live playlist
playlist_size = 5

# Lower the video bitrate when uploads can't keep up
adaptive_bitrate = false

# Filter: none, black-white, night, invert, mirror
filter = "none"

[upload]
# Seconds the uploader waits for the next segment before giving up.
# Unset = two segment durations, 0 = wait for the final playlist.
# idle_timeout = 20

# Remote key prefix (defaults to the session id)
# key_prefix = "streams/me"

# Mirror uploads into a local directory
# local_dir = "/srv/www/live"

# S3-compatible bucket (build with --features s3). Credentials come from
# AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY.
# bucket = "my-live-bucket"
# region = "us-east-1"
# endpoint = "https://s3.us-east-1.amazonaws.com"
# public_url = "https://my-live-bucket.s3.amazonaws.com"
"#
    .to_string()
}
