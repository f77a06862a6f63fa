//! Mock infrastructure for testing
//!
//! A scripted [`Platform`]: cameras only produce a frame when the test calls
//! [`MockPlatform::push_frame`], codecs answer every input immediately, and
//! everything acquired or released is recorded in a [`PlatformLog`].

#![allow(dead_code)]

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use livecast_core::capture::{CaptureDevice, FilterStage, FrameNotifier, Microphone};
use livecast_core::config::{AudioEncoderConfig, VideoEncoderConfig};
use livecast_core::encode::{AudioCodec, CodecOutput, HardwareCodec, VideoCodec};
use livecast_core::error::{LivecastError, Result};
use livecast_core::platform::Platform;
use livecast_core::types::{
    BufferInfo, CameraId, CaptureFrame, Filter, SampleFlags, TrackFormat, VideoSurface,
};
use livecast_core::upload::{RemoteStore, StorageCredentials, StoreProvider};

/// SPS/PPS stand-in the mock video codec reports
pub const VIDEO_CONFIG: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce];

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Everything the mock platform handed out or got back
#[derive(Debug, Default)]
pub struct PlatformLog {
    pub cameras_opened: Vec<CameraId>,
    pub cameras_closed: usize,
    pub microphones_closed: usize,
    /// Instance ids of every video codec created, in order
    pub video_codecs: Vec<usize>,
    pub audio_codecs: Vec<usize>,
    pub codecs_released: usize,
    pub filter_stages: usize,
    /// (codec instance, bitrate) for every `set_bitrate`
    pub bitrates: Vec<(usize, u32)>,
    /// Filter used for every rendered frame
    pub filters_rendered: Vec<Filter>,
    /// Codec instance that encoded each submitted frame
    pub frames_encoded: Vec<usize>,
}

pub struct MockPlatform {
    cameras: u32,
    failing_camera: Option<CameraId>,
    notifier: Arc<Mutex<Option<FrameNotifier>>>,
    frame_pending: Arc<AtomicBool>,
    next_instance: AtomicUsize,
    log: Arc<Mutex<PlatformLog>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::with_cameras(2)
    }

    pub fn with_cameras(cameras: u32) -> Self {
        Self {
            cameras,
            failing_camera: None,
            notifier: Arc::new(Mutex::new(None)),
            frame_pending: Arc::new(AtomicBool::new(false)),
            next_instance: AtomicUsize::new(1),
            log: Arc::new(Mutex::new(PlatformLog::default())),
        }
    }

    /// Opening `id` fails with `HardwareUnavailable`
    pub fn with_failing_camera(mut self, id: CameraId) -> Self {
        self.failing_camera = Some(id);
        self
    }

    /// Hand the open camera a frame and announce it; false when no camera
    /// is previewing
    pub fn push_frame(&self) -> bool {
        let notifier = self.notifier.lock().clone();
        match notifier {
            Some(notifier) => {
                self.frame_pending.store(true, Ordering::SeqCst);
                notifier.notify()
            }
            None => false,
        }
    }

    pub fn log(&self) -> MutexGuard<'_, PlatformLog> {
        self.log.lock()
    }

    fn next_instance(&self) -> usize {
        self.next_instance.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn name(&self) -> &str {
        "mock"
    }

    fn camera_count(&self) -> u32 {
        self.cameras
    }

    fn open_camera(&self, id: CameraId, config: &VideoEncoderConfig) -> Result<Box<dyn CaptureDevice>> {
        if self.failing_camera == Some(id) || id.0 >= self.cameras {
            return Err(LivecastError::hardware(format!("{} is busy", id)));
        }
        self.log.lock().cameras_opened.push(id);
        Ok(Box::new(MockCamera {
            id,
            width: config.width,
            height: config.height,
            notifier: Arc::clone(&self.notifier),
            frame_pending: Arc::clone(&self.frame_pending),
            log: Arc::clone(&self.log),
            closed: false,
        }))
    }

    fn open_microphone(&self, config: &AudioEncoderConfig) -> Result<Box<dyn Microphone>> {
        Ok(Box::new(MockMicrophone {
            sample_rate: config.sample_rate,
            channels: config.channels,
            log: Arc::clone(&self.log),
            closed: false,
        }))
    }

    fn create_filter_stage(&self, _width: u32, _height: u32) -> Result<Box<dyn FilterStage>> {
        self.log.lock().filter_stages += 1;
        Ok(Box::new(MockFilterStage {
            filter: Filter::None,
            log: Arc::clone(&self.log),
            released: false,
        }))
    }

    fn create_video_codec(&self, config: &VideoEncoderConfig) -> Result<Box<dyn VideoCodec>> {
        let instance = self.next_instance();
        self.log.lock().video_codecs.push(instance);
        Ok(Box::new(MockVideoCodec {
            output: MockOutput::new(instance, Arc::clone(&self.log)),
            format: TrackFormat::video(config.width, config.height, config.frame_rate, config.bitrate)
                .with_codec_config(VIDEO_CONFIG),
            last_pts: 0,
        }))
    }

    fn create_audio_codec(&self, config: &AudioEncoderConfig) -> Result<Box<dyn AudioCodec>> {
        let instance = self.next_instance();
        self.log.lock().audio_codecs.push(instance);
        Ok(Box::new(MockAudioCodec {
            output: MockOutput::new(instance, Arc::clone(&self.log)),
            format: TrackFormat::audio(config.sample_rate, config.channels, config.bitrate),
        }))
    }
}

pub struct MockCamera {
    id: CameraId,
    width: u32,
    height: u32,
    notifier: Arc<Mutex<Option<FrameNotifier>>>,
    frame_pending: Arc<AtomicBool>,
    log: Arc<Mutex<PlatformLog>>,
    closed: bool,
}

impl CaptureDevice for MockCamera {
    fn id(&self) -> CameraId {
        self.id
    }

    fn start_preview(&mut self, notifier: FrameNotifier) -> Result<()> {
        *self.notifier.lock() = Some(notifier);
        Ok(())
    }

    fn acquire_frame(&mut self) -> Result<Option<CaptureFrame>> {
        if self.closed || !self.frame_pending.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(CaptureFrame {
            width: self.width,
            height: self.height,
            data: vec![0x80; (self.width * self.height * 4) as usize],
            captured_at: Instant::now(),
        }))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.notifier.lock().take();
        self.log.lock().cameras_closed += 1;
    }
}

impl Drop for MockCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Silence, delivered a little faster than real time
pub struct MockMicrophone {
    sample_rate: u32,
    channels: u32,
    log: Arc<Mutex<PlatformLog>>,
    closed: bool,
}

impl Microphone for MockMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        if self.closed {
            return Err(LivecastError::hardware("microphone closed"));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(10)));
        buf.fill(0);
        Ok(buf.len())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().microphones_closed += 1;
        }
    }
}

pub struct MockFilterStage {
    filter: Filter,
    log: Arc<Mutex<PlatformLog>>,
    released: bool,
}

impl FilterStage for MockFilterStage {
    fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    fn filter(&self) -> Filter {
        self.filter
    }

    fn render(&mut self, _frame: &CaptureFrame, surface: &mut VideoSurface) -> Result<()> {
        if self.released {
            return Err(LivecastError::hardware("filter stage released"));
        }
        surface.data.fill(self.filter.id() as u8);
        self.log.lock().filters_rendered.push(self.filter);
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
    }
}

/// Output side shared by both mock codecs
struct MockOutput {
    instance: usize,
    pending: VecDeque<CodecOutput>,
    buffers: Vec<Vec<u8>>,
    format_sent: bool,
    released: bool,
    log: Arc<Mutex<PlatformLog>>,
}

impl MockOutput {
    fn new(instance: usize, log: Arc<Mutex<PlatformLog>>) -> Self {
        Self {
            instance,
            pending: VecDeque::new(),
            buffers: Vec::new(),
            format_sent: false,
            released: false,
            log,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.released {
            return Err(LivecastError::encoder(format!(
                "mock codec {} used after release",
                self.instance
            )));
        }
        Ok(())
    }

    fn format(&mut self, format: &TrackFormat) {
        if !self.format_sent {
            self.format_sent = true;
            self.pending.push_back(CodecOutput::FormatChanged(format.clone()));
        }
    }

    fn buffer(&mut self, data: Vec<u8>, pts_us: i64, flags: SampleFlags) {
        let index = self.buffers.len();
        let info = BufferInfo::new(data.len(), pts_us, flags);
        self.buffers.push(data);
        self.pending.push_back(CodecOutput::Buffer { index, info });
    }

    fn dequeue(&mut self) -> Result<CodecOutput> {
        self.check_open()?;
        Ok(self.pending.pop_front().unwrap_or(CodecOutput::TryAgainLater))
    }

    fn data(&self, index: usize) -> Result<&[u8]> {
        self.buffers
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| LivecastError::encoder(format!("no output buffer {}", index)))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.log.lock().codecs_released += 1;
        }
    }
}

/// Emits its format and configuration on the first frame, then one
/// keyframe per submitted frame
pub struct MockVideoCodec {
    output: MockOutput,
    format: TrackFormat,
    last_pts: i64,
}

impl HardwareCodec for MockVideoCodec {
    fn name(&self) -> &str {
        "mock-h264"
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<CodecOutput> {
        self.output.dequeue()
    }

    fn output_data(&self, index: usize) -> Result<&[u8]> {
        self.output.data(index)
    }

    fn release_output(&mut self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        self.output.check_open()?;
        self.output
            .log
            .lock()
            .bitrates
            .push((self.output.instance, bitrate));
        Ok(())
    }

    fn release(&mut self) {
        self.output.release();
    }
}

impl VideoCodec for MockVideoCodec {
    fn submit(&mut self, _surface: &VideoSurface, pts_us: i64) -> Result<()> {
        self.output.check_open()?;
        if !self.output.format_sent {
            self.output.format(&self.format);
            self.output
                .buffer(VIDEO_CONFIG.to_vec(), pts_us, SampleFlags::CODEC_CONFIG);
        }
        let instance = self.output.instance;
        self.output
            .buffer(vec![0, 0, 0, 1, 0x65, instance as u8], pts_us, SampleFlags::KEYFRAME);
        self.output.log.lock().frames_encoded.push(instance);
        self.last_pts = pts_us;
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        self.output.check_open()?;
        self.output.format(&self.format);
        self.output
            .buffer(Vec::new(), self.last_pts, SampleFlags::END_OF_STREAM);
        Ok(())
    }
}

/// One small AAC-sized packet per input buffer
pub struct MockAudioCodec {
    output: MockOutput,
    format: TrackFormat,
}

impl HardwareCodec for MockAudioCodec {
    fn name(&self) -> &str {
        "mock-aac"
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<CodecOutput> {
        self.output.dequeue()
    }

    fn output_data(&self, index: usize) -> Result<&[u8]> {
        self.output.data(index)
    }

    fn release_output(&mut self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn set_bitrate(&mut self, _bitrate: u32) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) {
        self.output.release();
    }
}

impl AudioCodec for MockAudioCodec {
    fn queue_input(&mut self, pcm: &[i16], pts_us: i64, end_of_stream: bool) -> Result<()> {
        self.output.check_open()?;
        self.output.format(&self.format);
        if !pcm.is_empty() {
            self.output.buffer(vec![0x21; 16], pts_us, SampleFlags::NONE);
        }
        if end_of_stream {
            self.output
                .buffer(Vec::new(), pts_us, SampleFlags::END_OF_STREAM);
        }
        Ok(())
    }
}

/// Remote store recording every put in order
#[derive(Clone, Default)]
pub struct RecordingProvider {
    puts: Arc<Mutex<Vec<(String, u64)>>>,
    connects: Arc<AtomicUsize>,
    /// Keys whose upload fails
    failing_keys: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every put takes at least `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.lock().push(key.into());
    }

    /// Keys in the order the store received them
    pub fn keys(&self) -> Vec<String> {
        self.puts.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn puts(&self) -> Vec<(String, u64)> {
        self.puts.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl StoreProvider for RecordingProvider {
    fn connect(&self, credentials: &StorageCredentials) -> Result<Box<dyn RemoteStore>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingStore {
            bucket: credentials.bucket.clone(),
            provider: self.clone(),
        }))
    }
}

struct RecordingStore {
    bucket: String,
    provider: RecordingProvider,
}

impl RemoteStore for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    fn put(&mut self, key: &str, source: &Path) -> Result<u64> {
        if !self.provider.delay.is_zero() {
            std::thread::sleep(self.provider.delay);
        }
        if self.provider.failing_keys.lock().iter().any(|k| k == key) {
            return Err(LivecastError::upload(format!("{} rejected", key)));
        }
        let bytes = std::fs::metadata(source)?.len();
        self.provider.puts.lock().push((key.to_string(), bytes));
        Ok(bytes)
    }

    fn url_for(&self, key: &str) -> String {
        format!("mock://{}/{}", self.bucket, key)
    }
}
