//! Integration tests for HLS segmentation on disk

mod mocks;

use std::path::Path;
use std::time::Duration;

use livecast_core::config::Session;
use livecast_core::mux::{MediaPlaylist, Muxer, SegmentedStreamMuxer};
use livecast_core::types::{BufferInfo, SampleFlags, TrackFormat, TrackIndex};
use mocks::VIDEO_CONFIG;

const AUDIO_FRAME: [u8; 16] = [0x21; 16];

fn hls_session(dir: &Path, segment_secs: u64, window: usize) -> Session {
    Session::builder(dir.join("index.m3u8"))
        .with_resolution(64, 36)
        .with_segment_duration(Duration::from_secs(segment_secs))
        .with_playlist_size(window)
        .build()
        .unwrap()
}

fn started_muxer(session: &Session) -> (SegmentedStreamMuxer, TrackIndex, TrackIndex) {
    let mut muxer = SegmentedStreamMuxer::new(session).unwrap();
    let video = muxer
        .add_track(&TrackFormat::video(64, 36, 10, 500_000).with_codec_config(VIDEO_CONFIG))
        .unwrap();
    assert!(!muxer.is_started());
    let audio = muxer.add_track(&TrackFormat::audio(44_100, 1, 96_000)).unwrap();
    assert!(muxer.is_started());
    (muxer, video, audio)
}

/// Ten frames a second with a keyframe on every whole second
fn write_frames(muxer: &mut SegmentedStreamMuxer, video: TrackIndex, audio: TrackIndex, frames: i64) {
    for i in 0..frames {
        let pts = i * 100_000;
        let flags = if i % 10 == 0 { SampleFlags::KEYFRAME } else { SampleFlags::NONE };
        let frame = [0x65, i as u8, 0x88];
        muxer
            .write_sample(video, &frame, &BufferInfo::new(frame.len(), pts, flags))
            .unwrap();
        muxer
            .write_sample(
                audio,
                &AUDIO_FRAME,
                &BufferInfo::new(AUDIO_FRAME.len(), pts, SampleFlags::NONE),
            )
            .unwrap();
    }
}

fn end_of_stream(muxer: &mut SegmentedStreamMuxer, track: TrackIndex, pts: i64) {
    muxer
        .write_sample(track, &[], &BufferInfo::new(0, pts, SampleFlags::END_OF_STREAM))
        .unwrap();
}

fn read_playlist(path: &Path) -> MediaPlaylist {
    MediaPlaylist::parse(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn assert_transport_stream(path: &Path) {
    let data = std::fs::read(path).unwrap();
    assert!(!data.is_empty(), "{:?} is empty", path);
    assert_eq!(data.len() % 188, 0);
    // every segment opens with a PAT
    assert_eq!(data[0], 0x47);
    assert_eq!((data[1] & 0x1f, data[2]), (0, 0));
}

#[test]
fn test_segments_rotate_on_keyframes_and_window_slides() {
    let dir = tempfile::tempdir().unwrap();
    let session = hls_session(dir.path(), 2, 2);
    let (mut muxer, video, audio) = started_muxer(&session);

    write_frames(&mut muxer, video, audio, 70);
    end_of_stream(&mut muxer, video, 7_000_000);
    assert!(!muxer.is_finished());
    end_of_stream(&mut muxer, audio, 7_000_000);
    assert!(muxer.is_finished());

    // cuts land on the configuration packets ahead of the 3 s and 5 s keyframes
    let out = session.output_dir();
    for i in 0..3 {
        assert_transport_stream(&out.join(format!("index{}.ts", i)));
    }
    assert!(!out.join("index3.ts").exists());

    let playlist = read_playlist(&session.output_path);
    assert!(playlist.ended);
    assert_eq!(playlist.media_sequence, 1);
    let uris: Vec<_> = playlist.entries.iter().map(|e| e.uri.as_str()).collect();
    assert_eq!(uris, vec!["index1.ts", "index2.ts"]);
    assert!((playlist.entries[0].duration - 2.0).abs() < 0.01);
    assert!(playlist.effective_target_duration() >= 2);
}

#[test]
fn test_live_playlist_grows_while_recording() {
    let dir = tempfile::tempdir().unwrap();
    let session = hls_session(dir.path(), 1, 5);
    let (mut muxer, video, audio) = started_muxer(&session);

    write_frames(&mut muxer, video, audio, 25);
    let live = read_playlist(&session.output_path);
    assert!(!live.ended);
    assert!(!live.entries.is_empty());
    assert!(!dir.path().join("index.m3u8.tmp").exists());

    muxer.stop().unwrap();
    let done = read_playlist(&session.output_path);
    assert!(done.ended);
    assert!(done.entries.len() > live.entries.len());
}

#[test]
fn test_stop_without_end_of_stream_finalizes_once() {
    let dir = tempfile::tempdir().unwrap();
    let session = hls_session(dir.path(), 10, 5);
    let (mut muxer, video, audio) = started_muxer(&session);

    write_frames(&mut muxer, video, audio, 15);
    muxer.stop().unwrap();
    muxer.stop().unwrap();

    let playlist = read_playlist(&session.output_path);
    assert!(playlist.ended);
    assert_eq!(playlist.entries.len(), 1);
    assert_eq!(playlist.entries[0].uri, "index0.ts");
    assert_transport_stream(&session.output_dir().join("index0.ts"));

    let late = muxer.write_sample(video, &[0x65], &BufferInfo::new(1, 2_000_000, SampleFlags::KEYFRAME));
    assert!(late.is_err());
}

#[test]
fn test_audio_before_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let session = hls_session(dir.path(), 10, 5);
    let mut muxer = SegmentedStreamMuxer::new(&session).unwrap();
    let audio = muxer.add_track(&TrackFormat::audio(44_100, 1, 96_000)).unwrap();

    let err = muxer
        .write_sample(audio, &AUDIO_FRAME, &BufferInfo::new(16, 0, SampleFlags::NONE))
        .unwrap_err();
    assert_eq!(err.kind(), livecast_core::ErrorKind::ProtocolViolation);
    assert!(!session.output_dir().join("index0.ts").exists());
}
