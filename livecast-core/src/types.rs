//! Core types for livecast
//!
//! These types represent the data that flows between the capture sources,
//! the encoders, the muxers and the upload queue.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

/// Kind of elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Video,
    Audio,
}

impl TrackType {
    /// Fixed container slot for this track type (video first)
    pub fn slot(&self) -> usize {
        match self {
            TrackType::Video => 0,
            TrackType::Audio => 1,
        }
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackType::Video => write!(f, "video"),
            TrackType::Audio => write!(f, "audio"),
        }
    }
}

/// Per-buffer flags reported by a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const NONE: SampleFlags = SampleFlags(0);
    /// Self-contained decodable access unit
    pub const KEYFRAME: SampleFlags = SampleFlags(1);
    /// Codec setup parameters (SPS/PPS, AudioSpecificConfig), not media
    pub const CODEC_CONFIG: SampleFlags = SampleFlags(2);
    /// Last buffer the codec will produce
    pub const END_OF_STREAM: SampleFlags = SampleFlags(4);

    pub fn contains(&self, other: SampleFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_keyframe(&self) -> bool {
        self.contains(Self::KEYFRAME)
    }

    pub fn is_codec_config(&self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for SampleFlags {
    type Output = SampleFlags;

    fn bitor(self, rhs: SampleFlags) -> SampleFlags {
        SampleFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SampleFlags {
    fn bitor_assign(&mut self, rhs: SampleFlags) {
        self.0 |= rhs.0;
    }
}

/// Metadata of one compressed output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    /// Offset of the payload inside the codec buffer
    pub offset: usize,
    /// Payload size in bytes (zero for a bare end-of-stream marker)
    pub size: usize,
    /// Session-relative presentation time in microseconds
    pub presentation_time_us: i64,
    pub flags: SampleFlags,
}

impl BufferInfo {
    pub fn new(size: usize, presentation_time_us: i64, flags: SampleFlags) -> Self {
        Self {
            offset: 0,
            size,
            presentation_time_us,
            flags,
        }
    }
}

/// Encoder output format, reported once before the first data buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFormat {
    /// MIME type, e.g. `video/avc` or `audio/mp4a-latm`
    pub mime: String,
    pub track_type: TrackType,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate: u32,
    /// Codec setup data when the codec exposes it out of band
    pub codec_config: Option<Vec<u8>>,
}

impl TrackFormat {
    pub const MIME_AVC: &'static str = "video/avc";
    pub const MIME_AAC: &'static str = "audio/mp4a-latm";

    /// H.264 video format
    pub fn video(width: u32, height: u32, frame_rate: u32, bitrate: u32) -> Self {
        Self {
            mime: Self::MIME_AVC.to_string(),
            track_type: TrackType::Video,
            width,
            height,
            frame_rate,
            sample_rate: 0,
            channels: 0,
            bitrate,
            codec_config: None,
        }
    }

    /// AAC-LC audio format
    pub fn audio(sample_rate: u32, channels: u32, bitrate: u32) -> Self {
        Self {
            mime: Self::MIME_AAC.to_string(),
            track_type: TrackType::Audio,
            width: 0,
            height: 0,
            frame_rate: 0,
            sample_rate,
            channels,
            bitrate,
            codec_config: None,
        }
    }

    /// Attach out-of-band codec setup data
    pub fn with_codec_config(mut self, config: impl Into<Vec<u8>>) -> Self {
        self.codec_config = Some(config.into());
        self
    }
}

impl std::fmt::Display for TrackFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.track_type {
            TrackType::Video => write!(
                f,
                "{} {}x{}@{} {}kbps",
                self.mime,
                self.width,
                self.height,
                self.frame_rate,
                self.bitrate / 1000
            ),
            TrackType::Audio => write!(
                f,
                "{} {}Hz {}ch {}kbps",
                self.mime,
                self.sample_rate,
                self.channels,
                self.bitrate / 1000
            ),
        }
    }
}

/// Index the muxer assigned to a registered track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackIndex(pub usize);

impl std::fmt::Display for TrackIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// A finished output file ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub local_file: PathBuf,
    pub sequence_index: u64,
    pub is_manifest: bool,
    pub is_last: bool,
}

impl Segment {
    /// Media segment; the index is the trailing number of `<stem><N>.ts`
    pub fn media(local_file: impl Into<PathBuf>) -> Self {
        let local_file = local_file.into();
        let sequence_index = local_file
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| {
                let digits = stem.len() - stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
                stem[stem.len() - digits..].parse().unwrap_or(0)
            })
            .unwrap_or(0);
        Self {
            local_file,
            sequence_index,
            is_manifest: false,
            is_last: false,
        }
    }

    /// Playlist version `sequence_index`; the last one closes the stream
    pub fn manifest(local_file: impl Into<PathBuf>, sequence_index: u64, is_last: bool) -> Self {
        Self {
            local_file: local_file.into(),
            sequence_index,
            is_manifest: true,
            is_last,
        }
    }
}

/// What kind of output file closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Manifest,
    MediaSegment,
    Thumbnail,
}

impl SegmentKind {
    /// Classify an output file by its extension
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "m3u8" => Some(SegmentKind::Manifest),
            "ts" => Some(SegmentKind::MediaSegment),
            "jpg" | "jpeg" => Some(SegmentKind::Thumbnail),
            _ => None,
        }
    }
}

/// Raw RGBA frame delivered by a capture device
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA, `width * height * 4` bytes
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

/// Encoder input surface the filter stage renders into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSurface {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA
    pub data: Vec<u8>,
}

impl VideoSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width as usize) * (height as usize) * 4],
        }
    }
}

/// Capture device selector (0 is the default/back camera)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CameraId(pub u32);

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "camera{}", self.0)
    }
}

/// Image filter applied by the GPU stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    #[default]
    None,
    BlackWhite,
    Night,
    Invert,
    Mirror,
}

impl Filter {
    pub const ALL: [Filter; 5] = [
        Filter::None,
        Filter::BlackWhite,
        Filter::Night,
        Filter::Invert,
        Filter::Mirror,
    ];

    pub fn id(&self) -> u32 {
        *self as u32
    }

    pub fn from_id(id: u32) -> Option<Filter> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Filter::None => "none",
            Filter::BlackWhite => "black-white",
            Filter::Night => "night",
            Filter::Invert => "invert",
            Filter::Mirror => "mirror",
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Filter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(Filter::None),
            "black-white" | "bw" | "mono" => Ok(Filter::BlackWhite),
            "night" => Ok(Filter::Night),
            "invert" => Ok(Filter::Invert),
            "mirror" => Ok(Filter::Mirror),
            _ => Err(format!("Unknown filter: {}", s)),
        }
    }
}

/// Recording lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    Idle,
    Preparing,
    Ready,
    Recording,
    Draining,
    Released,
}

impl std::fmt::Display for EncoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EncoderState::Idle => "idle",
            EncoderState::Preparing => "preparing",
            EncoderState::Ready => "ready",
            EncoderState::Recording => "recording",
            EncoderState::Draining => "draining",
            EncoderState::Released => "released",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_flags_combine() {
        let flags = SampleFlags::KEYFRAME | SampleFlags::END_OF_STREAM;
        assert!(flags.is_keyframe());
        assert!(flags.is_end_of_stream());
        assert!(!flags.is_codec_config());
        assert!(!SampleFlags::NONE.contains(SampleFlags::NONE));
    }

    #[test]
    fn test_segment_kind_by_extension() {
        assert_eq!(
            SegmentKind::from_path(Path::new("/r/index.m3u8")),
            Some(SegmentKind::Manifest)
        );
        assert_eq!(
            SegmentKind::from_path(Path::new("/r/index3.ts")),
            Some(SegmentKind::MediaSegment)
        );
        assert_eq!(
            SegmentKind::from_path(Path::new("/r/thumb_1.jpg")),
            Some(SegmentKind::Thumbnail)
        );
        assert_eq!(SegmentKind::from_path(Path::new("/r/index.m3u8.tmp")), None);
        assert_eq!(SegmentKind::from_path(Path::new("/r/README")), None);
    }

    #[test]
    fn test_segment_sequence_from_name() {
        let segment = Segment::media("/r/index12.ts");
        assert_eq!(segment.sequence_index, 12);
        assert!(!segment.is_manifest);
        assert_eq!(Segment::media("/r/cam2_7.ts").sequence_index, 7);
        assert_eq!(Segment::media("/r/index.ts").sequence_index, 0);

        let manifest = Segment::manifest("/r/m3u8/vod.m3u8", 4, true);
        assert!(manifest.is_manifest && manifest.is_last);
    }

    #[test]
    fn test_filter_ids() {
        for filter in Filter::ALL {
            assert_eq!(Filter::from_id(filter.id()), Some(filter));
            assert_eq!(filter.name().parse::<Filter>(), Ok(filter));
        }
        assert_eq!(Filter::from_id(15), None);
    }
}
