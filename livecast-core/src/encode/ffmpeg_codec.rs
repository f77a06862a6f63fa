//! FFmpeg-backed codecs
//!
//! libavcodec is push/pull rather than buffer-queue based, so each codec
//! keeps a small queue of finished output buffers and replays them through
//! [`HardwareCodec::dequeue_output`]. Encoders are opened with global headers
//! so the codec setup data is reported with the output format and as a
//! leading configuration buffer.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{self, encoder};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{self, Flags};
use ffmpeg_next::util::frame::audio::Audio;
use ffmpeg_next::util::frame::video::Video;
use ffmpeg_next::{ChannelLayout, Dictionary, Rational};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{AudioCodec, CodecOutput, HardwareCodec, VideoCodec};
use crate::config::{AudioEncoderConfig, VideoEncoderConfig, AUDIO_SAMPLES_PER_FRAME};
use crate::error::{LivecastError, Result};
use crate::types::{BufferInfo, SampleFlags, TrackFormat, VideoSurface};

const MICROSECONDS: Rational = Rational(1, 1_000_000);

/// H.264 encoders in preference order
const VIDEO_ENCODERS: [&str; 2] = ["h264_nvenc", "libx264"];

/// H.264 encoders this FFmpeg build provides
pub fn available_video_encoders() -> Vec<&'static str> {
    ffmpeg::init().ok();
    VIDEO_ENCODERS
        .iter()
        .copied()
        .filter(|name| encoder::find_by_name(name).is_some())
        .collect()
}

/// Finished output waiting to be dequeued
#[derive(Default)]
struct OutputQueue {
    pending: VecDeque<CodecOutput>,
    buffers: Vec<Option<Vec<u8>>>,
}

impl OutputQueue {
    fn push_format(&mut self, format: TrackFormat) {
        let config = format.codec_config.clone();
        self.pending.push_back(CodecOutput::FormatChanged(format));
        if let Some(config) = config {
            self.push_buffer(config, 0, SampleFlags::CODEC_CONFIG);
        }
    }

    fn push_buffer(&mut self, data: Vec<u8>, pts_us: i64, flags: SampleFlags) {
        let info = BufferInfo::new(data.len(), pts_us, flags);
        let index = match self.buffers.iter().position(Option::is_none) {
            Some(free) => {
                self.buffers[free] = Some(data);
                free
            }
            None => {
                self.buffers.push(Some(data));
                self.buffers.len() - 1
            }
        };
        self.pending.push_back(CodecOutput::Buffer { index, info });
    }

    fn next(&mut self) -> CodecOutput {
        self.pending.pop_front().unwrap_or(CodecOutput::TryAgainLater)
    }

    fn data(&self, index: usize) -> Result<&[u8]> {
        self.buffers
            .get(index)
            .and_then(|b| b.as_deref())
            .ok_or_else(|| LivecastError::encoder(format!("No output buffer {}", index)))
    }

    fn release(&mut self, index: usize) -> Result<()> {
        match self.buffers.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(LivecastError::encoder(format!(
                "Output buffer {} released twice",
                index
            ))),
        }
    }
}

/// Codec setup data of an opened encoder
///
/// # Safety
/// `ctx` must point to an opened codec context.
unsafe fn extradata(ctx: *const ffmpeg::ffi::AVCodecContext) -> Option<Vec<u8>> {
    unsafe {
        let size = (*ctx).extradata_size;
        if (*ctx).extradata.is_null() || size <= 0 {
            return None;
        }
        Some(std::slice::from_raw_parts((*ctx).extradata, size as usize).to_vec())
    }
}

/// H.264 via NVENC, falling back to libx264
pub struct FfmpegVideoCodec {
    name: String,
    encoder: encoder::Video,
    scaler: scaling::Context,
    source: Video,
    frame: Video,
    packet: ffmpeg::Packet,
    output: OutputQueue,
    flushing: bool,
    finished: bool,
    released: bool,
}

impl FfmpegVideoCodec {
    pub fn new(config: &VideoEncoderConfig) -> Result<Self> {
        ffmpeg::init()
            .map_err(|e| LivecastError::encoder(format!("FFmpeg init failed: {}", e)))?;

        let mut last_error = None;
        for name in VIDEO_ENCODERS {
            match Self::open(name, config) {
                Ok(codec) => return Ok(codec),
                Err(e) => {
                    debug!("Encoder {} unavailable: {}", name, e);
                    last_error = Some(e);
                }
            }
        }
        Err(LivecastError::hardware(format!(
            "No H.264 encoder could be opened: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn open(name: &str, config: &VideoEncoderConfig) -> Result<Self> {
        let codec = encoder::find_by_name(name)
            .ok_or_else(|| LivecastError::hardware(format!("Encoder {} not found", name)))?;

        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| LivecastError::encoder(format!("Failed to create encoder context: {}", e)))?;

        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(MICROSECONDS);
        encoder.set_frame_rate(Some(Rational::new(config.frame_rate as i32, 1)));
        encoder.set_bit_rate(config.bitrate as usize);
        encoder.set_max_bit_rate(config.bitrate as usize * 2);
        encoder.set_gop(config.gop_size());
        encoder.set_max_b_frames(0);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        if name == "libx264" {
            opts.set("preset", "veryfast");
            opts.set("tune", "zerolatency");
        } else {
            opts.set("preset", "p4");
            opts.set("tune", "ll");
            opts.set("rc", "cbr");
        }
        opts.set("profile", "main");

        let encoder = encoder
            .open_with(opts)
            .map_err(|e| LivecastError::hardware(format!("Failed to open {}: {}", name, e)))?;

        let scaler = scaling::Context::get(
            Pixel::RGBA,
            config.width,
            config.height,
            Pixel::YUV420P,
            config.width,
            config.height,
            Flags::BILINEAR,
        )
        .map_err(|e| LivecastError::encoder(format!("Failed to create scaler: {}", e)))?;

        // SAFETY: the encoder was opened above and outlives this call
        let config_data = unsafe { extradata(encoder.as_ptr()) };
        let mut format = TrackFormat::video(config.width, config.height, config.frame_rate, config.bitrate);
        format.codec_config = config_data;
        let mut output = OutputQueue::default();
        output.push_format(format);

        info!(
            "Video encoder opened: {} {}x{} @ {}fps, {} kbps",
            name,
            config.width,
            config.height,
            config.frame_rate,
            config.bitrate / 1000
        );

        Ok(Self {
            name: name.to_string(),
            encoder,
            scaler,
            source: Video::new(Pixel::RGBA, config.width, config.height),
            frame: Video::new(Pixel::YUV420P, config.width, config.height),
            packet: ffmpeg::Packet::empty(),
            output,
            flushing: false,
            finished: false,
            released: false,
        })
    }

    fn receive_packets(&mut self) -> Result<()> {
        loop {
            match self.encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    let data = self.packet.data().map(|d| d.to_vec()).unwrap_or_default();
                    let pts = self.packet.pts().unwrap_or(0);
                    let flags = if self.packet.is_key() {
                        SampleFlags::KEYFRAME
                    } else {
                        SampleFlags::NONE
                    };
                    trace!("{} packet pts={} size={}", self.name, pts, data.len());
                    self.output.push_buffer(data, pts, flags);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => {
                    if !self.finished {
                        self.finished = true;
                        self.output.push_buffer(Vec::new(), 0, SampleFlags::END_OF_STREAM);
                    }
                    break;
                }
                Err(e) => {
                    return Err(LivecastError::encoder(format!(
                        "{} failed to receive packet: {}",
                        self.name, e
                    )));
                }
            }
        }
        Ok(())
    }
}

impl HardwareCodec for FfmpegVideoCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<CodecOutput> {
        if self.output.pending.is_empty() && self.flushing && !self.finished {
            self.receive_packets()?;
        }
        Ok(self.output.next())
    }

    fn output_data(&self, index: usize) -> Result<&[u8]> {
        self.output.data(index)
    }

    fn release_output(&mut self, index: usize) -> Result<()> {
        self.output.release(index)
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        // SAFETY: writes a plain field of the opened context; libx264 and
        // NVENC pick the new rate up on the next frame
        unsafe {
            let ctx = self.encoder.as_mut_ptr();
            (*ctx).bit_rate = bitrate as i64;
            (*ctx).rc_max_rate = bitrate as i64 * 2;
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.flushing {
            // drain the codec so its device resources are returned
            if self.encoder.send_eof().is_ok() {
                while self.encoder.receive_packet(&mut self.packet).is_ok() {}
            }
        }
        self.output = OutputQueue::default();
        debug!("{} released", self.name);
    }
}

impl VideoCodec for FfmpegVideoCodec {
    fn submit(&mut self, surface: &VideoSurface, pts_us: i64) -> Result<()> {
        let row = surface.width as usize * 4;
        let stride = self.source.stride(0);
        let plane = self.source.data_mut(0);
        for (y, src) in surface.data.chunks_exact(row).enumerate() {
            let start = y * stride;
            if let Some(dst) = plane.get_mut(start..start + row) {
                dst.copy_from_slice(src);
            }
        }

        self.scaler
            .run(&self.source, &mut self.frame)
            .map_err(|e| LivecastError::encoder(format!("Scaling failed: {}", e)))?;
        self.frame.set_pts(Some(pts_us));
        self.encoder
            .send_frame(&self.frame)
            .map_err(|e| LivecastError::encoder(format!("Failed to send frame: {}", e)))?;
        self.receive_packets()
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        if self.flushing {
            return Ok(());
        }
        self.flushing = true;
        self.encoder
            .send_eof()
            .map_err(|e| LivecastError::encoder(format!("Failed to send EOF: {}", e)))?;
        self.receive_packets()
    }
}

/// AAC-LC via the native FFmpeg encoder
pub struct FfmpegAudioCodec {
    encoder: encoder::Audio,
    frame: Audio,
    packet: ffmpeg::Packet,
    output: OutputQueue,
    sample_rate: u32,
    channels: usize,
    frame_size: usize,
    pending: Vec<i16>,
    pending_pts_us: Option<i64>,
    flushing: bool,
    finished: bool,
    released: bool,
}

impl FfmpegAudioCodec {
    pub fn new(config: &AudioEncoderConfig) -> Result<Self> {
        ffmpeg::init()
            .map_err(|e| LivecastError::encoder(format!("FFmpeg init failed: {}", e)))?;

        let codec = encoder::find_by_name("aac")
            .ok_or_else(|| LivecastError::hardware("AAC encoder not found"))?;
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(|e| LivecastError::encoder(format!("Failed to create audio encoder: {}", e)))?;

        let layout = match config.channels {
            1 => ChannelLayout::MONO,
            2 => ChannelLayout::STEREO,
            n => {
                return Err(LivecastError::config(format!("Unsupported channel count {}", n)));
            }
        };
        let sample_format = ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Planar);
        encoder.set_rate(config.sample_rate as i32);
        encoder.set_bit_rate(config.bitrate as usize);
        encoder.set_format(sample_format);
        encoder.set_time_base(Rational::new(1, config.sample_rate as i32));
        encoder.set_channel_layout(layout);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        opts.set("aac_coder", "twoloop");
        let encoder = encoder
            .open_with(opts)
            .map_err(|e| LivecastError::encoder(format!("Failed to open audio encoder: {}", e)))?;

        let frame_size = match encoder.frame_size() as usize {
            0 => AUDIO_SAMPLES_PER_FRAME,
            n => n,
        };

        // SAFETY: the encoder was opened above
        let config_data = unsafe { extradata(encoder.as_ptr()) };
        let mut format = TrackFormat::audio(config.sample_rate, config.channels, config.bitrate);
        format.codec_config = config_data;
        let mut output = OutputQueue::default();
        output.push_format(format);

        info!(
            "Audio encoder opened: aac {}ch @ {}Hz, {} kbps, frame_size={}",
            config.channels,
            config.sample_rate,
            config.bitrate / 1000,
            frame_size
        );

        let mut frame = Audio::new(sample_format, frame_size, layout);
        frame.set_rate(config.sample_rate);

        Ok(Self {
            encoder,
            frame,
            packet: ffmpeg::Packet::empty(),
            output,
            sample_rate: config.sample_rate,
            channels: config.channels as usize,
            frame_size,
            pending: Vec::with_capacity(frame_size * config.channels as usize * 2),
            pending_pts_us: None,
            flushing: false,
            finished: false,
            released: false,
        })
    }

    fn us_to_samples(&self, us: i64) -> i64 {
        us * self.sample_rate as i64 / 1_000_000
    }

    fn samples_to_us(&self, samples: i64) -> i64 {
        samples * 1_000_000 / self.sample_rate as i64
    }

    fn encode_frame(&mut self, samples: usize, pts_us: i64) -> Result<()> {
        self.frame.set_samples(samples);
        for ch in 0..self.channels {
            let plane = self.frame.data_mut(ch);
            for i in 0..samples {
                let value = self.pending[i * self.channels + ch] as f32 / 32768.0;
                plane[i * 4..i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
            }
        }
        self.pending.drain(..samples * self.channels);

        let pts = self.us_to_samples(pts_us);
        self.frame.set_pts(Some(pts));
        self.encoder
            .send_frame(&self.frame)
            .map_err(|e| LivecastError::encoder(format!("Failed to send audio frame: {}", e)))?;
        self.receive_packets()
    }

    fn receive_packets(&mut self) -> Result<()> {
        loop {
            match self.encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    let data = self.packet.data().map(|d| d.to_vec()).unwrap_or_default();
                    let pts_us = self.samples_to_us(self.packet.pts().unwrap_or(0));
                    self.output.push_buffer(data, pts_us.max(0), SampleFlags::NONE);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => {
                    if !self.finished {
                        self.finished = true;
                        self.output.push_buffer(Vec::new(), 0, SampleFlags::END_OF_STREAM);
                    }
                    break;
                }
                Err(e) => {
                    return Err(LivecastError::encoder(format!(
                        "Failed to receive audio packet: {}",
                        e
                    )));
                }
            }
        }
        Ok(())
    }
}

impl HardwareCodec for FfmpegAudioCodec {
    fn name(&self) -> &str {
        "aac"
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<CodecOutput> {
        if self.output.pending.is_empty() && self.flushing && !self.finished {
            self.receive_packets()?;
        }
        Ok(self.output.next())
    }

    fn output_data(&self, index: usize) -> Result<&[u8]> {
        self.output.data(index)
    }

    fn release_output(&mut self, index: usize) -> Result<()> {
        self.output.release(index)
    }

    fn set_bitrate(&mut self, _bitrate: u32) -> Result<()> {
        warn!("AAC encoder bitrate is fixed once opened");
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pending.clear();
        self.output = OutputQueue::default();
        debug!("aac released");
    }
}

impl AudioCodec for FfmpegAudioCodec {
    fn queue_input(&mut self, pcm: &[i16], pts_us: i64, end_of_stream: bool) -> Result<()> {
        if self.flushing {
            return Ok(());
        }
        if self.pending.is_empty() {
            self.pending_pts_us = Some(pts_us);
        }
        self.pending.extend_from_slice(pcm);

        let frame_len = self.frame_size * self.channels;
        while self.pending.len() >= frame_len {
            let pts = self.pending_pts_us.unwrap_or(pts_us);
            self.encode_frame(self.frame_size, pts)?;
            self.pending_pts_us = Some(pts + self.samples_to_us(self.frame_size as i64));
        }

        if end_of_stream {
            let remaining = self.pending.len() / self.channels;
            if remaining > 0 {
                let pts = self.pending_pts_us.unwrap_or(pts_us);
                self.encode_frame(remaining, pts)?;
            }
            self.flushing = true;
            self.encoder
                .send_eof()
                .map_err(|e| LivecastError::encoder(format!("Failed to send audio EOF: {}", e)))?;
            self.receive_packets()?;
        }
        Ok(())
    }
}
