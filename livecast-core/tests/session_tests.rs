//! Integration tests for the session state machine and worker threads
//!
//! Everything runs against the scripted mock platform; no capture or codec
//! hardware is needed.

mod mocks;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use livecast_core::capture::{AudioSource, FrameSource, RecordingClock};
use livecast_core::config::Session;
use livecast_core::error::ErrorKind;
use livecast_core::mux::{create_muxer, MediaPlaylist};
use livecast_core::session::{EventBus, SessionController, SessionEvent};
use livecast_core::types::{CameraId, EncoderState, Filter, TrackIndex};
use mocks::{wait_for, MockPlatform};

const TIMEOUT: Duration = Duration::from_secs(5);

fn session(dir: &Path) -> Session {
    Session::builder(dir.join("index.m3u8"))
        .with_resolution(64, 36)
        .with_segment_duration(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Push `n` frames, waiting for the worker to process each one
fn record_frames(platform: &MockPlatform, controller: &SessionController, n: u64) {
    for _ in 0..n {
        let before = controller.frames_processed();
        assert!(wait_for(TIMEOUT, || platform.push_frame()), "no camera previewing");
        assert!(
            wait_for(TIMEOUT, || controller.frames_processed() > before),
            "frame not processed"
        );
    }
}

/// Record until both encoders have registered their tracks
fn record_until_started(platform: &MockPlatform, controller: &SessionController) {
    record_frames(platform, controller, 1);
    assert!(wait_for(TIMEOUT, || controller.audio_track().is_some()));
    record_frames(platform, controller, 3);
}

#[test]
fn test_frames_before_prepare_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(dir.path());
    let platform = Arc::new(MockPlatform::new());
    let muxer = create_muxer(&session, platform.as_ref()).unwrap();
    let source = FrameSource::spawn(
        platform.clone(),
        &session,
        muxer,
        RecordingClock::new(),
        EventBus::new(),
    )
    .unwrap();

    let notifier = source.notifier();
    for _ in 0..3 {
        assert!(notifier.notify());
    }
    source.prepare(None).unwrap();
    source.wait_until_ready(TIMEOUT).unwrap();

    assert_eq!(source.frames_processed(), 0);
    assert_eq!(source.frames_dropped(), 3);
    assert!(source.is_running());
}

#[test]
fn test_prepare_reaches_ready() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session(dir.path()));
    let mut events = controller.subscribe();

    assert_eq!(controller.state(), EncoderState::Idle);
    controller.prepare(None).unwrap();
    assert_eq!(controller.state(), EncoderState::Ready);

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged { from, to } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (EncoderState::Idle, EncoderState::Preparing),
            (EncoderState::Preparing, EncoderState::Ready),
        ]
    );

    let log = platform.log();
    assert_eq!(log.cameras_opened, vec![CameraId(0)]);
    assert_eq!(log.video_codecs.len(), 1);
    assert_eq!(log.audio_codecs.len(), 1);
    assert_eq!(log.filter_stages, 1);
}

#[test]
fn test_commands_out_of_order_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let controller = SessionController::new(Arc::new(MockPlatform::new()), session(dir.path()));

    let err = controller.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = controller.stop().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    controller.prepare(None).unwrap();
    let err = controller.prepare(None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = controller.adjust_bitrate(500_000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn test_record_writes_finished_playlist() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(dir.path());
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session.clone());

    controller.prepare(None).unwrap();
    controller.start().unwrap();
    assert_eq!(controller.state(), EncoderState::Recording);
    record_until_started(&platform, &controller);

    assert_eq!(controller.video_track(), Some(TrackIndex(0)));
    assert_eq!(controller.audio_track(), Some(TrackIndex(1)));
    assert!(controller.muxer().unwrap().lock().is_started());

    controller.stop().unwrap();
    assert_eq!(controller.state(), EncoderState::Released);
    assert!(controller.muxer().is_none());

    let playlist =
        MediaPlaylist::parse(&std::fs::read_to_string(&session.output_path).unwrap()).unwrap();
    assert!(playlist.ended);
    assert_eq!(playlist.entries.len(), 1);
    let segment = session.output_dir().join(&playlist.entries[0].uri);
    let len = std::fs::metadata(&segment).unwrap().len();
    assert!(len > 0);
    assert_eq!(len % 188, 0);

    let log = platform.log();
    assert_eq!(log.codecs_released, 2);
    assert_eq!(log.cameras_closed, 1);
    assert_eq!(log.microphones_closed, 1);
}

#[test]
fn test_double_stop_releases_once() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session(dir.path()));
    let mut events = controller.subscribe();

    controller.prepare(None).unwrap();
    controller.start().unwrap();
    record_until_started(&platform, &controller);

    controller.stop().unwrap();
    controller.stop().unwrap();
    assert_eq!(controller.state(), EncoderState::Released);

    let mut released = 0;
    let mut stopped = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::StateChanged {
                from: EncoderState::Draining,
                to: EncoderState::Released,
            } => released += 1,
            SessionEvent::Stopped => stopped += 1,
            _ => {}
        }
    }
    assert_eq!(released, 1);
    assert_eq!(stopped, 1);
    assert_eq!(platform.log().codecs_released, 2);
}

#[test]
fn test_camera_hot_swap_keeps_encoder_and_filter() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session(dir.path()));

    controller.prepare(None).unwrap();
    controller.apply_filter(Filter::Night.id()).unwrap();
    controller.start().unwrap();
    record_until_started(&platform, &controller);

    let video_track = controller.video_track();
    let audio_track = controller.audio_track();
    assert!(video_track.is_some());

    controller.set_camera(CameraId(1)).unwrap();
    assert!(wait_for(TIMEOUT, || platform.log().cameras_opened.len() == 2));
    record_frames(&platform, &controller, 3);

    assert_eq!(controller.video_track(), video_track);
    assert_eq!(controller.audio_track(), audio_track);
    assert_eq!(controller.camera(), CameraId(1));
    assert_eq!(controller.filter(), Filter::Night);
    assert_eq!(controller.state(), EncoderState::Recording);

    {
        let log = platform.log();
        assert_eq!(log.cameras_opened, vec![CameraId(0), CameraId(1)]);
        assert_eq!(log.cameras_closed, 1);
        assert_eq!(log.video_codecs.len(), 1);
        assert_eq!(log.codecs_released, 0);
        let instance = log.video_codecs[0];
        assert!(log.frames_encoded.iter().all(|&i| i == instance));
        assert!(log.filters_rendered.iter().all(|&f| f == Filter::Night));
    }

    controller.stop().unwrap();
}

#[test]
fn test_hot_swap_to_missing_camera_keeps_previous() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::with_cameras(3).with_failing_camera(CameraId(2)));
    let controller = SessionController::new(platform.clone(), session(dir.path()));
    let mut events = controller.subscribe();

    controller.prepare(None).unwrap();
    controller.start().unwrap();
    record_frames(&platform, &controller, 1);

    controller.set_camera(CameraId(2)).unwrap();
    assert!(wait_for(TIMEOUT, || platform.log().cameras_opened.len() == 2));
    record_frames(&platform, &controller, 2);
    assert_eq!(
        platform.log().cameras_opened,
        vec![CameraId(0), CameraId(0)]
    );
    assert_eq!(controller.state(), EncoderState::Recording);

    let mut errors = 0;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Error { kind, .. } = event {
            assert_eq!(kind, ErrorKind::HardwareUnavailable);
            errors += 1;
        }
    }
    assert_eq!(errors, 1);

    let err = controller.set_camera(CameraId(7)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    controller.stop().unwrap();
}

#[test]
fn test_failed_prepare_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new().with_failing_camera(CameraId(0)));
    let controller = SessionController::new(platform.clone(), session(dir.path()));
    let mut events = controller.subscribe();

    let err = controller.prepare(None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HardwareUnavailable);
    assert_eq!(controller.state(), EncoderState::Released);

    let log = platform.log();
    assert_eq!(log.video_codecs.len(), 1);
    assert_eq!(log.audio_codecs.len(), 1);
    assert_eq!(log.codecs_released, 2);
    assert_eq!(log.microphones_closed, 1);
    drop(log);

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Error { kind, .. } = event {
            assert_eq!(kind, ErrorKind::HardwareUnavailable);
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[test]
fn test_filter_change_applies_to_next_frame() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session(dir.path()));

    controller.prepare(None).unwrap();
    controller.start().unwrap();
    record_frames(&platform, &controller, 2);

    controller.apply_filter(Filter::Invert.id()).unwrap();
    assert_eq!(controller.filter(), Filter::Invert);
    record_frames(&platform, &controller, 1);
    assert_eq!(platform.log().filters_rendered.last(), Some(&Filter::Invert));

    let err = controller.apply_filter(99).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(controller.filter(), Filter::Invert);

    controller.stop().unwrap();
}

#[test]
fn test_adjust_bitrate_while_recording() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session(dir.path()));

    controller.prepare(None).unwrap();
    controller.start().unwrap();
    record_frames(&platform, &controller, 1);

    controller.adjust_bitrate(500_000).unwrap();
    // clamped to the adaptive floor
    controller.adjust_bitrate(100_000).unwrap();
    assert!(wait_for(TIMEOUT, || platform.log().bitrates.len() == 2));

    let log = platform.log();
    let instance = log.video_codecs[0];
    assert_eq!(log.bitrates, vec![(instance, 500_000), (instance, 300_000)]);
    drop(log);

    controller.stop().unwrap();
}

#[test]
fn test_thumbnail_written_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(dir.path());
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session.clone());
    let mut events = controller.subscribe();

    controller.prepare(None).unwrap();
    controller.start().unwrap();
    controller.request_thumbnail(Some(2), 2).unwrap();
    record_frames(&platform, &controller, 2);
    controller.stop().unwrap();

    let mut thumbnail = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::ThumbnailWritten { path } = event {
            thumbnail = Some(path);
        }
    }
    let thumbnail = thumbnail.unwrap();
    assert!(thumbnail.starts_with(session.output_dir()));
    assert_eq!(image::image_dimensions(&thumbnail).unwrap(), (32, 18));
}

#[test]
fn test_reset_builds_fresh_encoders() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session(dir.path()));

    controller.prepare(None).unwrap();
    controller.set_camera(CameraId(1)).unwrap();
    controller.apply_filter(Filter::Mirror.id()).unwrap();
    controller.start().unwrap();
    record_until_started(&platform, &controller);
    controller.stop().unwrap();

    let err = controller.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let next = session(dir.path());
    controller.reset(next.clone()).unwrap();
    assert_eq!(controller.state(), EncoderState::Ready);
    assert_eq!(controller.session().id, next.id);
    assert_eq!(controller.camera(), CameraId(1));
    assert_eq!(controller.filter(), Filter::Mirror);

    controller.start().unwrap();
    record_until_started(&platform, &controller);
    controller.stop().unwrap();

    let log = platform.log();
    assert_eq!(log.video_codecs.len(), 2);
    assert_eq!(log.audio_codecs.len(), 2);
    assert_eq!(log.codecs_released, 4);
    assert_eq!(log.cameras_opened.last(), Some(&CameraId(1)));
    assert!(next.output_path.exists());
}

#[test]
fn test_drop_while_recording_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(dir.path());
    let platform = Arc::new(MockPlatform::new());
    {
        let controller = SessionController::new(platform.clone(), session.clone());
        controller.prepare(None).unwrap();
        controller.start().unwrap();
        record_until_started(&platform, &controller);
    }

    let playlist =
        MediaPlaylist::parse(&std::fs::read_to_string(&session.output_path).unwrap()).unwrap();
    assert!(playlist.ended);
    assert_eq!(platform.log().codecs_released, 2);
}

#[test]
fn test_audio_waits_for_first_video_frame() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(dir.path());
    let platform = Arc::new(MockPlatform::new());
    let muxer = create_muxer(&session, platform.as_ref()).unwrap();
    let clock = RecordingClock::new();
    let mut audio = AudioSource::spawn(
        platform.clone(),
        &session,
        muxer,
        clock.clone(),
        EventBus::new(),
    )
    .unwrap();

    audio.start();
    assert!(wait_for(TIMEOUT, || audio.samples_dropped() > 0));
    // audio alone never fixes time zero
    assert!(!clock.is_started());
    assert_eq!(audio.audio_track(), None);

    // the video worker stamps its first frame
    clock.elapsed_us(Instant::now());
    assert!(wait_for(TIMEOUT, || audio.audio_track().is_some()));
    assert!(audio.samples_read() > audio.samples_dropped());

    audio.stop();
    audio.join();
}

#[test]
fn test_stop_before_any_output_reports_missing_tracks() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(dir.path());
    let platform = Arc::new(MockPlatform::new());
    let controller = SessionController::new(platform.clone(), session);
    let mut events = controller.subscribe();

    controller.prepare(None).unwrap();
    controller.start().unwrap();
    controller.stop().unwrap();
    assert_eq!(controller.state(), EncoderState::Released);

    let mut details = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Error { kind, detail } = event {
            assert_eq!(kind, ErrorKind::InvalidState);
            assert!(!kind.is_fatal());
            details.push(detail);
        }
    }
    assert_eq!(details.len(), 1);
    assert!(details[0].contains("video or audio"), "{}", details[0]);
}
