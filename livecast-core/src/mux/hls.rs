//! HLS media playlists and the TS segmenter

use bytes::BytesMut;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace};

use super::mpegts::TsMuxer;
use super::segmented::{FramedPacket, PacketSink};
use crate::error::{LivecastError, Result, ResultExt};
use crate::types::TrackType;

/// One `#EXTINF` entry
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub uri: String,
    /// Seconds
    pub duration: f64,
}

/// HLS media playlist (version 3)
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    /// Seconds; raised to cover the longest entry when rendering
    pub target_duration: u64,
    pub media_sequence: u64,
    pub entries: Vec<PlaylistEntry>,
    pub ended: bool,
}

impl MediaPlaylist {
    pub fn new(target_duration: u64) -> Self {
        Self {
            target_duration,
            media_sequence: 0,
            entries: Vec::new(),
            ended: false,
        }
    }

    pub fn push(&mut self, uri: impl Into<String>, duration: f64) {
        self.entries.push(PlaylistEntry {
            uri: uri.into(),
            duration,
        });
    }

    /// Keep the newest `window` entries, advancing the media sequence
    pub fn trim_to(&mut self, window: usize) {
        if self.entries.len() > window {
            let excess = self.entries.len() - window;
            self.entries.drain(..excess);
            self.media_sequence += excess as u64;
        }
    }

    /// Target duration actually written (integer seconds, rounded up)
    pub fn effective_target_duration(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.duration.ceil() as u64)
            .max()
            .unwrap_or(0)
            .max(self.target_duration)
    }

    pub fn render(&self) -> String {
        let mut m3u8 = String::new();
        m3u8.push_str("#EXTM3U\n");
        m3u8.push_str("#EXT-X-VERSION:3\n");
        m3u8.push_str(&format!(
            "#EXT-X-TARGETDURATION:{}\n",
            self.effective_target_duration()
        ));
        m3u8.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));
        for entry in &self.entries {
            m3u8.push_str(&format!("#EXTINF:{:.3},\n", entry.duration));
            m3u8.push_str(&entry.uri);
            m3u8.push('\n');
        }
        if self.ended {
            m3u8.push_str("#EXT-X-ENDLIST\n");
        }
        m3u8
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("#EXTM3U") {
            return Err(LivecastError::config("Playlist does not start with #EXTM3U"));
        }

        let mut playlist = MediaPlaylist::new(0);
        let mut pending: Option<f64> = None;
        for line in lines {
            if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                playlist.target_duration = parse_number(value, line)?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                playlist.media_sequence = parse_number(value, line)?;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let seconds = value.split(',').next().unwrap_or_default();
                pending = Some(parse_number(seconds, line)?);
            } else if line == "#EXT-X-ENDLIST" {
                playlist.ended = true;
            } else if line.starts_with('#') {
                trace!("Ignoring playlist tag {}", line);
            } else {
                let duration = pending.take().ok_or_else(|| {
                    LivecastError::config(format!("Playlist URI {} without #EXTINF", line))
                })?;
                playlist.push(line, duration);
            }
        }
        Ok(playlist)
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, line: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LivecastError::config(format!("Malformed playlist line: {}", line)))
}

/// Write a file via a temporary sibling and rename it into place
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

struct OpenSegment {
    file: BufWriter<File>,
    path: PathBuf,
    start_us: i64,
}

/// Cuts framed packets into `<stem><N>.ts` files and maintains the live
/// playlist beside them.
pub struct HlsSegmenter {
    dir: PathBuf,
    stem: String,
    playlist_path: PathBuf,
    target: Duration,
    window: usize,
    ts: TsMuxer,
    buf: BytesMut,
    current: Option<OpenSegment>,
    next_index: u64,
    playlist: MediaPlaylist,
    last_was_config: bool,
    last_pts_us: i64,
    segments_written: u64,
}

impl HlsSegmenter {
    /// `playlist_path` is e.g. `<dir>/index.m3u8`; segments land beside it
    pub fn new(playlist_path: &Path, target: Duration, window: usize, has_audio: bool) -> Self {
        let dir = playlist_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = playlist_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("index")
            .to_string();
        Self {
            dir,
            stem,
            playlist_path: playlist_path.to_path_buf(),
            target,
            window: window.max(1),
            ts: TsMuxer::new(has_audio),
            buf: BytesMut::with_capacity(64 * 1024),
            current: None,
            next_index: 0,
            playlist: MediaPlaylist::new(target.as_secs_f64().ceil() as u64),
            last_was_config: false,
            last_pts_us: 0,
            segments_written: 0,
        }
    }

    /// File name of segment `index`
    pub fn segment_name(&self, index: u64) -> String {
        format!("{}{}.ts", self.stem, index)
    }

    pub fn segments_written(&self) -> u64 {
        self.segments_written
    }

    pub fn playlist(&self) -> &MediaPlaylist {
        &self.playlist
    }

    fn open_segment(&mut self, start_us: i64) -> Result<()> {
        let name = self.segment_name(self.next_index);
        let path = self.dir.join(&name);
        let file = File::create(&path)
            .map_err(LivecastError::from)
            .context(format!("creating segment {}", name))?;
        self.next_index += 1;
        debug!("Opened segment {:?} at {} us", path, start_us);

        self.current = Some(OpenSegment {
            file: BufWriter::new(file),
            path,
            start_us,
        });
        self.ts.write_tables(&mut self.buf);
        Ok(())
    }

    fn close_segment(&mut self, end_us: i64) -> Result<()> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };
        segment.file.flush()?;
        let name = segment
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        // Closing the handle is what the segment watcher sees
        drop(segment.file);

        let duration = (end_us - segment.start_us).max(0) as f64 / 1_000_000.0;
        self.playlist.push(name, duration);
        self.playlist.trim_to(self.window);
        self.segments_written += 1;
        self.write_playlist()?;
        debug!("Closed segment {:?} ({:.3}s)", segment.path, duration);
        Ok(())
    }

    fn write_playlist(&self) -> Result<()> {
        write_atomic(&self.playlist_path, self.playlist.render().as_bytes())
            .context("writing playlist")
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if let Some(segment) = self.current.as_mut() {
            segment.file.write_all(&self.buf)?;
        }
        self.buf.clear();
        Ok(())
    }
}

impl PacketSink for HlsSegmenter {
    fn write_packet(&mut self, packet: &FramedPacket) -> Result<()> {
        let is_video = packet.track == TrackType::Video;
        // A keyframe directly after its configuration packet belongs to the same cut point
        let cut_point =
            is_video && (packet.is_config || (packet.is_keyframe && !self.last_was_config));

        let target_us = self.target.as_micros() as i64;
        match self.current.as_ref().map(|s| s.start_us) {
            None => self.open_segment(packet.pts_us)?,
            Some(start_us) if cut_point && packet.pts_us - start_us >= target_us => {
                self.close_segment(packet.pts_us)?;
                self.open_segment(packet.pts_us)?;
            }
            Some(_) => {}
        }

        match packet.track {
            TrackType::Video => self.ts.write_video(
                &mut self.buf,
                packet.pts_us,
                packet.is_keyframe || packet.is_config,
                &packet.data,
            ),
            TrackType::Audio => self.ts.write_audio(&mut self.buf, packet.pts_us, &packet.data),
        }
        self.flush_buffer()?;

        if is_video {
            self.last_was_config = packet.is_config;
        }
        self.last_pts_us = self.last_pts_us.max(packet.pts_us);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.close_segment(self.last_pts_us)?;
        self.playlist.ended = true;
        self.write_playlist()?;
        info!(
            "Finished HLS stream {:?}: {} segments",
            self.playlist_path, self.segments_written
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_window_and_endlist() {
        let mut playlist = MediaPlaylist::new(10);
        for i in 0..7 {
            playlist.push(format!("index{}.ts", i), 10.0);
        }
        playlist.trim_to(5);
        playlist.ended = true;
        let text = playlist.render();
        assert!(text.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:2\n"));
        assert!(!text.contains("index1.ts"));
        assert!(text.contains("#EXTINF:10.000,\nindex6.ts\n"));
        assert!(text.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn test_target_duration_covers_longest_entry() {
        let mut playlist = MediaPlaylist::new(10);
        playlist.push("a.ts", 10.4);
        assert_eq!(playlist.effective_target_duration(), 11);
    }

    #[test]
    fn test_parse_rendered() {
        let mut playlist = MediaPlaylist::new(4);
        playlist.media_sequence = 3;
        playlist.push("index3.ts", 4.0);
        playlist.push("index4.ts", 3.5);
        let parsed = MediaPlaylist::parse(&playlist.render()).unwrap();
        assert_eq!(parsed, playlist);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MediaPlaylist::parse("hello").is_err());
        assert!(MediaPlaylist::parse("#EXTM3U\nindex0.ts\n").is_err());
    }
}
