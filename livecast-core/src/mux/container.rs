//! Direct-container muxer
//!
//! Interleaving and track bookkeeping are delegated to a platform
//! multiplexer ([`ContainerWriter`]). Configuration buffers are not written
//! as samples; the writer takes them from the track format.

use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

use super::{Muxer, MuxerState, TrackTable, SESSION_TRACKS};
use crate::error::{LivecastError, Result};
use crate::types::{BufferInfo, TrackFormat, TrackIndex};

/// Platform container multiplexer (MP4 and friends)
pub trait ContainerWriter: Send {
    /// Add a stream; returns the writer's stream index
    fn add_stream(&mut self, format: &TrackFormat) -> Result<usize>;

    fn write_header(&mut self) -> Result<()>;

    /// Write one access unit; `pts_us` is session-relative microseconds
    fn write_packet(&mut self, stream: usize, data: &[u8], pts_us: i64, keyframe: bool)
    -> Result<()>;

    fn write_trailer(&mut self) -> Result<()>;
}

pub struct DirectContainerMuxer {
    tracks: TrackTable,
    writer: Box<dyn ContainerWriter>,
    streams: [Option<usize>; SESSION_TRACKS],
    path: PathBuf,
    finalized: bool,
    packets_written: u64,
}

impl DirectContainerMuxer {
    pub fn new(path: PathBuf, writer: Box<dyn ContainerWriter>, tracks: usize) -> Self {
        Self {
            tracks: TrackTable::new(tracks),
            writer,
            streams: [None; SESSION_TRACKS],
            path,
            finalized: false,
            packets_written: 0,
        }
    }

    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.writer.write_trailer()?;
        info!(
            "Container {:?} complete ({} packets)",
            self.path, self.packets_written
        );
        Ok(())
    }
}

impl Muxer for DirectContainerMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackIndex> {
        let index = self.tracks.register(format)?;
        let stream = self.writer.add_stream(format)?;
        self.streams[index.0] = Some(stream);
        info!("Added {} as {} (stream {})", format, index, stream);

        if self.tracks.is_complete() {
            self.start()?;
        }
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        if self.tracks.start()? {
            self.writer.write_header()?;
            debug!("Container header written");
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.tracks.state() == MuxerState::Started
    }

    fn write_sample(&mut self, track: TrackIndex, data: &[u8], info: &BufferInfo) -> Result<()> {
        self.tracks.check_writable(track)?;

        if info.flags.is_codec_config() {
            trace!("Skipping configuration buffer on {}", track);
        } else if !data.is_empty() {
            let stream = self.streams[track.0]
                .ok_or_else(|| LivecastError::protocol(format!("{} has no stream", track)))?;
            self.writer.write_packet(
                stream,
                data,
                info.presentation_time_us,
                info.flags.is_keyframe(),
            )?;
            self.packets_written += 1;
        }

        if info.flags.is_end_of_stream() && self.tracks.finish_track(track) {
            self.finalize()?;
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

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_writer::FfmpegContainerWriter;

#[cfg(feature = "ffmpeg")]
mod ffmpeg_writer {
    use super::ContainerWriter;
    use crate::error::{LivecastError, Result};
    use crate::types::{TrackFormat, TrackType};
    use ffmpeg::codec::Id;
    use ffmpeg::format::{context::Output, output};
    use ffmpeg::Rational;
    use ffmpeg_next as ffmpeg;
    use std::path::{Path, PathBuf};
    use tracing::{error, info};

    const MICROSECONDS: Rational = Rational(1, 1_000_000);

    /// MP4 writer over libavformat
    pub struct FfmpegContainerWriter {
        path: PathBuf,
        output: Output,
        header_written: bool,
        trailer_written: bool,
    }

    impl FfmpegContainerWriter {
        pub fn create(path: &Path) -> Result<Self> {
            ffmpeg::init()?;
            let output = output(&path).map_err(|e| {
                LivecastError::encoder(format!("Failed to create output file: {}", e))
            })?;
            info!("Creating container writer: {:?}", path);
            Ok(Self {
                path: path.to_path_buf(),
                output,
                header_written: false,
                trailer_written: false,
            })
        }
    }

    impl ContainerWriter for FfmpegContainerWriter {
        fn add_stream(&mut self, format: &TrackFormat) -> Result<usize> {
            let codec_id = match format.track_type {
                TrackType::Video => Id::H264,
                TrackType::Audio => Id::AAC,
            };
            let mut stream = self.output.add_stream(codec_id).map_err(|e| {
                LivecastError::encoder(format!("Failed to add {} stream: {}", format.track_type, e))
            })?;

            let codec_par = stream.parameters();
            // SAFETY: rust-ffmpeg has no setters for AVCodecParameters. The pointer
            // belongs to the stream just created and stays valid while `output` lives;
            // extradata is allocated with av_mallocz so libavformat can free it.
            unsafe {
                let ptr = codec_par.as_ptr() as *mut ffmpeg::ffi::AVCodecParameters;
                (*ptr).codec_id = codec_id.into();
                (*ptr).bit_rate = format.bitrate as i64;
                match format.track_type {
                    TrackType::Video => {
                        (*ptr).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                        (*ptr).width = format.width as i32;
                        (*ptr).height = format.height as i32;
                        (*ptr).format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
                    }
                    TrackType::Audio => {
                        (*ptr).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
                        (*ptr).sample_rate = format.sample_rate as i32;
                        (*ptr).ch_layout.nb_channels = format.channels as i32;
                        (*ptr).format = ffmpeg::ffi::AVSampleFormat::AV_SAMPLE_FMT_FLTP as i32;
                        (*ptr).frame_size = crate::config::AUDIO_SAMPLES_PER_FRAME as i32;
                    }
                }
                if let Some(config) = &format.codec_config {
                    let padding = ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                    let extradata = ffmpeg::ffi::av_mallocz(config.len() + padding) as *mut u8;
                    if extradata.is_null() {
                        return Err(LivecastError::encoder("Failed to allocate codec extradata"));
                    }
                    std::ptr::copy_nonoverlapping(config.as_ptr(), extradata, config.len());
                    (*ptr).extradata = extradata;
                    (*ptr).extradata_size = config.len() as i32;
                }
            }
            stream.set_time_base(MICROSECONDS);

            Ok(self.output.nb_streams() as usize - 1)
        }

        fn write_header(&mut self) -> Result<()> {
            if self.header_written {
                return Ok(());
            }
            self.output.write_header().map_err(|e| {
                LivecastError::encoder(format!("Failed to write file header: {}", e))
            })?;
            self.header_written = true;
            Ok(())
        }

        fn write_packet(
            &mut self,
            stream: usize,
            data: &[u8],
            pts_us: i64,
            keyframe: bool,
        ) -> Result<()> {
            let mut pkt = ffmpeg::Packet::copy(data);
            pkt.set_stream(stream);
            pkt.set_pts(Some(pts_us));
            pkt.set_dts(Some(pts_us));
            if keyframe {
                pkt.set_flags(ffmpeg::packet::Flags::KEY);
            }
            let time_base = self
                .output
                .stream(stream)
                .map(|s| s.time_base())
                .unwrap_or(MICROSECONDS);
            pkt.rescale_ts(MICROSECONDS, time_base);
            pkt.write_interleaved(&mut self.output).map_err(|e| {
                LivecastError::encoder(format!("Failed to write packet: {}", e))
            })?;
            Ok(())
        }

        fn write_trailer(&mut self) -> Result<()> {
            if !self.header_written || self.trailer_written {
                return Ok(());
            }
            self.trailer_written = true;
            self.output.write_trailer().map_err(|e| {
                LivecastError::encoder(format!("Failed to write file trailer: {}", e))
            })?;
            info!("Container file complete: {:?}", self.path);
            Ok(())
        }
    }

    impl Drop for FfmpegContainerWriter {
        fn drop(&mut self) {
            if self.header_written && !self.trailer_written {
                if let Err(e) = self.output.write_trailer() {
                    error!("Failed to write file trailer on drop: {}", e);
                }
            }
        }
    }
}
