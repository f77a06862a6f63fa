//! Segmented-stream muxer: manual framing for HLS
//!
//! The H.264 configuration (SPS/PPS) is captured once and re-sent as its own
//! packet right before every keyframe, so each segment is independently
//! decodable. AAC packets get an ADTS header each.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

use super::{adts, HlsSegmenter, Muxer, TrackTable, SESSION_TRACKS};
use crate::config::Session;
use crate::error::{LivecastError, Result};
use crate::types::{BufferInfo, TrackFormat, TrackIndex, TrackType};

/// Configuration packets are stamped this far ahead of their keyframe
pub const CONFIG_PACKET_LEAD_US: i64 = 1_000;

/// A packet after framing, ready for the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPacket {
    pub track: TrackType,
    pub pts_us: i64,
    pub data: Bytes,
    pub is_keyframe: bool,
    /// Synthetic configuration packet preceding a keyframe
    pub is_config: bool,
}

/// Destination of framed packets (the TS segmenter, or a recorder in tests)
pub trait PacketSink: Send {
    fn write_packet(&mut self, packet: &FramedPacket) -> Result<()>;

    /// Close the last segment and mark the stream ended
    fn finish(&mut self) -> Result<()>;
}

pub struct SegmentedStreamMuxer {
    tracks: TrackTable,
    sink: Box<dyn PacketSink>,
    path: PathBuf,
    video_config: Option<Bytes>,
    audio: Option<(u32, u32)>,
    finalized: bool,
    config_packets: u64,
}

impl SegmentedStreamMuxer {
    /// HLS output for a session (`<dir>/<stem>.m3u8` plus `<stem><N>.ts`)
    pub fn new(session: &Session) -> Result<Self> {
        let segmenter = HlsSegmenter::new(
            &session.output_path,
            session.segment_duration,
            session.playlist_size,
            true,
        );
        Ok(Self::with_sink(
            session.output_path.clone(),
            Box::new(segmenter),
            SESSION_TRACKS,
        ))
    }

    /// Muxer over an arbitrary sink expecting `tracks` tracks
    pub fn with_sink(path: PathBuf, sink: Box<dyn PacketSink>, tracks: usize) -> Self {
        Self {
            tracks: TrackTable::new(tracks),
            sink,
            path,
            video_config: None,
            audio: None,
            finalized: false,
            config_packets: 0,
        }
    }

    /// Configuration packets emitted so far
    pub fn config_packets(&self) -> u64 {
        self.config_packets
    }

    fn write_video(&mut self, data: &[u8], info: &BufferInfo) -> Result<()> {
        if info.flags.is_codec_config() {
            if self.video_config.is_none() {
                debug!("Captured {} byte video configuration", data.len());
                self.video_config = Some(Bytes::copy_from_slice(data));
            } else {
                trace!("Ignoring repeated video configuration");
            }
            return Ok(());
        }

        let keyframe = info.flags.is_keyframe();
        if keyframe {
            if let Some(config) = &self.video_config {
                let packet = FramedPacket {
                    track: TrackType::Video,
                    pts_us: (info.presentation_time_us - CONFIG_PACKET_LEAD_US).max(0),
                    data: config.clone(),
                    is_keyframe: false,
                    is_config: true,
                };
                self.sink.write_packet(&packet)?;
                self.config_packets += 1;
            } else {
                warn!("Keyframe at {} us before any video configuration", info.presentation_time_us);
            }
        }

        self.sink.write_packet(&FramedPacket {
            track: TrackType::Video,
            pts_us: info.presentation_time_us,
            data: Bytes::copy_from_slice(data),
            is_keyframe: keyframe,
            is_config: false,
        })
    }

    fn write_audio(&mut self, data: &[u8], info: &BufferInfo) -> Result<()> {
        if info.flags.is_codec_config() {
            // ADTS headers carry everything AudioSpecificConfig would
            trace!("Skipping audio configuration buffer");
            return Ok(());
        }
        let (sample_rate, channels) = self
            .audio
            .ok_or_else(|| LivecastError::protocol("audio sample without audio format"))?;
        let framed = adts::frame(data, sample_rate, channels)?;
        self.sink.write_packet(&FramedPacket {
            track: TrackType::Audio,
            pts_us: info.presentation_time_us,
            data: framed,
            is_keyframe: true,
            is_config: false,
        })
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.sink.finish()?;
        info!("Segmented stream {:?} finalized", self.path);
        Ok(())
    }
}

impl Muxer for SegmentedStreamMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackIndex> {
        let index = self.tracks.register(format)?;
        match format.track_type {
            TrackType::Video => {
                if let Some(config) = &format.codec_config {
                    self.video_config = Some(Bytes::copy_from_slice(config));
                }
            }
            TrackType::Audio => {
                // validates the ADTS parameters up front
                adts::AdtsHeader::for_payload(format.sample_rate, format.channels, 0)?;
                self.audio = Some((format.sample_rate, format.channels));
            }
        }
        info!("Added {} as {}", format, index);

        if self.tracks.is_complete() {
            self.start()?;
        }
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        if self.tracks.start()? {
            info!("Segmented muxer started with {} track(s)", self.tracks.registered());
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.tracks.state() == super::MuxerState::Started
    }

    fn write_sample(&mut self, track: TrackIndex, data: &[u8], info: &BufferInfo) -> Result<()> {
        let track_type = self.tracks.check_writable(track)?.track_type;

        if !data.is_empty() {
            match track_type {
                TrackType::Video => self.write_video(data, info)?,
                TrackType::Audio => self.write_audio(data, info)?,
            }
        }

        if info.flags.is_end_of_stream() {
            debug!("{} reached end of stream", track);
            if self.tracks.finish_track(track) {
                self.finalize()?;
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.tracks.stop() {
            self.finalize()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.tracks.release();
    }

    fn is_finished(&self) -> bool {
        self.tracks.is_finished()
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}
