//! Integration tests for session building, the config file and errors

use std::time::Duration;

use livecast_core::config::{sample_config, ConfigFile, MuxerStrategy, Session};
use livecast_core::error::{ErrorKind, LivecastError, ResultExt};
use livecast_core::types::{CameraId, Filter};
use tempfile::TempDir;

#[test]
fn test_session_defaults() {
    let dir = TempDir::new().unwrap();
    let session = Session::builder(dir.path().join("index.m3u8")).build().unwrap();

    assert_eq!((session.video.width, session.video.height), (1280, 720));
    assert_eq!(session.video.bitrate, 2_000_000);
    assert_eq!(session.video.frame_rate, 30);
    assert_eq!(session.video.gop_size(), 30);
    assert_eq!(session.audio.sample_rate, 44_100);
    assert_eq!(session.audio.channels, 1);
    assert_eq!(session.audio.bitrate, 96_000);
    assert_eq!(session.segment_duration, Duration::from_secs(10));
    assert_eq!(session.playlist_size, 5);
    assert!(!session.adaptive_bitrate);
    assert_eq!(session.camera, CameraId(0));
    assert_eq!(session.filter, Filter::None);
    assert_eq!(session.upload.idle_timeout, Some(Duration::from_secs(20)));
    assert_eq!(session.total_bitrate(), 2_096_000);
}

#[test]
fn test_strategy_from_extension() {
    let dir = TempDir::new().unwrap();
    let hls = Session::builder(dir.path().join("index.m3u8")).build().unwrap();
    assert_eq!(hls.muxer, MuxerStrategy::SegmentedStream);
    let mp4 = Session::builder(dir.path().join("take.mp4")).build().unwrap();
    assert_eq!(mp4.muxer, MuxerStrategy::DirectContainer);

    let err = Session::builder(dir.path().join("take.avi")).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_output_path_expanded_with_session_id() {
    let dir = TempDir::new().unwrap();
    let first = Session::builder(dir.path().join("index.m3u8")).build().unwrap();
    let second = Session::builder(dir.path().join("index.m3u8")).build().unwrap();

    assert_ne!(first.id, second.id);
    assert_ne!(first.output_path, second.output_path);
    assert_eq!(first.output_dir(), dir.path().join(first.id.to_string()));
    assert!(first.output_dir().is_dir());
    assert_eq!(first.output_path.file_name().unwrap(), "index.m3u8");
    assert_eq!(first.output_stem(), "index");
    assert_eq!(first.key_prefix(), first.id.to_string());
}

#[test]
fn test_invalid_parameters_rejected() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("index.m3u8");
    let builds = [
        Session::builder(&out).with_resolution(1279, 720).build(),
        Session::builder(&out).with_resolution(0, 720).build(),
        Session::builder(&out).with_video_bitrate(0).build(),
        Session::builder(&out).with_frame_rate(0).build(),
        Session::builder(&out).with_audio_bitrate(0).build(),
        Session::builder(&out).with_segment_duration(Duration::ZERO).build(),
        Session::builder(&out).with_playlist_size(0).build(),
    ];
    for result in builds {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{}", err);
    }

    let mut audio = livecast_core::config::AudioEncoderConfig::default();
    audio.channels = 3;
    assert!(audio.validate().is_err());
    audio.channels = 2;
    audio.sample_rate = 12_345;
    assert!(audio.validate().is_err());
    audio.sample_rate = 48_000;
    assert!(audio.validate().is_ok());

    // nothing is created for a rejected session
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = ConfigFile::default();
    config.video.width = 1920;
    config.video.height = 1080;
    config.output.segment_duration = 6;
    config.output.filter = "night".to_string();
    config.upload.bucket = Some("live".to_string());
    config.save_to(path.clone()).unwrap();

    let loaded = ConfigFile::load_from(path).unwrap();
    assert_eq!(loaded.video.width, 1920);
    assert_eq!(loaded.video.height, 1080);
    assert_eq!(loaded.output.segment_duration, 6);
    assert_eq!(loaded.output.filter, "night");
    assert_eq!(loaded.upload.bucket.as_deref(), Some("live"));
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = ConfigFile::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.video.width, 1280);
    assert_eq!(config.output.playlist_size, 5);
}

#[test]
fn test_malformed_config_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[video]\nwidth = \"wide\"\n").unwrap();
    let err = ConfigFile::load_from(path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_config_file_applies_to_builder() {
    let dir = TempDir::new().unwrap();
    let config: ConfigFile = toml::from_str(
        r#"
        [video]
        width = 640
        height = 360
        bitrate = 800

        [output]
        segment_duration = 4
        adaptive_bitrate = true
        filter = "night"

        [upload]
        idle_timeout = 0
        key_prefix = "streams/me"
        "#,
    )
    .unwrap();

    let session = config
        .apply(Session::builder(dir.path().join("index.m3u8")))
        .unwrap()
        .with_frame_rate(25)
        .build()
        .unwrap();

    assert_eq!((session.video.width, session.video.height), (640, 360));
    assert_eq!(session.video.bitrate, 800_000);
    assert_eq!(session.video.frame_rate, 25);
    assert_eq!(session.segment_duration, Duration::from_secs(4));
    assert!(session.adaptive_bitrate);
    assert_eq!(session.filter, Filter::Night);
    assert_eq!(session.upload.idle_timeout, None);
    assert_eq!(session.key_prefix(), "streams/me");
}

#[test]
fn test_unknown_filter_in_config_rejected() {
    let mut config = ConfigFile::default();
    config.output.filter = "sepia".to_string();
    let err = config.apply(Session::builder("/tmp/index.m3u8")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_sample_config_builds_a_session() {
    let dir = TempDir::new().unwrap();
    let config: ConfigFile = toml::from_str(&sample_config()).unwrap();
    let session = config
        .apply(Session::builder(dir.path().join("index.m3u8")))
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(session.video.bitrate, 2_000_000);
    assert_eq!(session.upload.idle_timeout, Some(Duration::from_secs(20)));
}

#[test]
fn test_error_context_keeps_kind_and_hint() {
    let base = LivecastError::hardware("camera0 is busy");
    let hint = base.user_hint();
    let wrapped = base.with_context("Opening capture device");

    assert!(wrapped.to_string().contains("Opening capture device"));
    assert!(wrapped.to_string().contains("camera0 is busy"));
    assert_eq!(wrapped.kind(), ErrorKind::HardwareUnavailable);
    assert_eq!(wrapped.user_hint(), hint);
    assert!(wrapped.is_fatal());
}

#[test]
fn test_result_ext_on_io_errors() {
    let result: std::io::Result<()> = Err(std::io::Error::other("disk full"));
    let err = result.context("Writing segment").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientIo);
    assert!(!err.is_fatal());
    assert!(err.to_string().starts_with("Writing segment"));
}

#[test]
fn test_protocol_violations_are_fatal() {
    let err = LivecastError::protocol("write_sample before start");
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert!(err.is_fatal());
    assert!(!err.is_user_recoverable());

    let err = LivecastError::invalid_state("start", "idle");
    assert!(!err.is_fatal());
    assert!(err.to_string().contains("idle"));
}
