//! Synthetic capture sources for hosts without camera hardware

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{CaptureDevice, FrameNotifier, Microphone};
use crate::error::{LivecastError, Result};
use crate::types::{CameraId, CaptureFrame};

/// Colour bars scrolling one column per frame
pub struct TestPatternCamera {
    id: CameraId,
    width: u32,
    height: u32,
    frame_rate: u32,
    latest: Arc<Mutex<Option<CaptureFrame>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

const BARS: [[u8; 3]; 7] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
];

impl TestPatternCamera {
    pub fn new(id: CameraId, width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            id,
            width,
            height,
            frame_rate: frame_rate.max(1),
            latest: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Render frame `n` of the pattern
    pub fn pattern(id: CameraId, width: u32, height: u32, n: u64) -> CaptureFrame {
        let (w, h) = (width as usize, height as usize);
        let mut data = vec![0u8; w * h * 4];
        let bar_width = (w / BARS.len()).max(1);
        // second camera shows the bars in reverse
        let reverse = id.0 % 2 == 1;
        for y in 0..h {
            for x in 0..w {
                let column = (x + n as usize) % w;
                let mut bar = (column / bar_width).min(BARS.len() - 1);
                if reverse {
                    bar = BARS.len() - 1 - bar;
                }
                let offset = (y * w + x) * 4;
                data[offset..offset + 3].copy_from_slice(&BARS[bar]);
                data[offset + 3] = 255;
            }
        }
        CaptureFrame {
            width,
            height,
            data,
            captured_at: Instant::now(),
        }
    }
}

impl CaptureDevice for TestPatternCamera {
    fn id(&self) -> CameraId {
        self.id
    }

    fn start_preview(&mut self, notifier: FrameNotifier) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let (id, width, height) = (self.id, self.width, self.height);
        let interval = Duration::from_secs(1) / self.frame_rate;
        let latest = Arc::clone(&self.latest);
        let running = Arc::clone(&self.running);

        let thread = std::thread::Builder::new()
            .name(format!("livecast-{}", id))
            .spawn(move || {
                let started = Instant::now();
                let mut n = 0u64;
                while running.load(Ordering::SeqCst) {
                    *latest.lock() = Some(Self::pattern(id, width, height, n));
                    if !notifier.notify() {
                        debug!("{} lost its frame listener", id);
                        break;
                    }
                    n += 1;
                    let next = started + interval * n as u32;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        std::thread::sleep(wait);
                    }
                }
            })
            .map_err(|e| LivecastError::hardware(format!("Failed to spawn {} thread: {}", id, e)))?;

        info!("{} started: {}x{} @ {}fps", self.id, width, height, self.frame_rate);
        self.thread = Some(thread);
        Ok(())
    }

    fn acquire_frame(&mut self) -> Result<Option<CaptureFrame>> {
        Ok(self.latest.lock().take())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("{} thread panicked", self.id);
            }
            debug!("{} closed", self.id);
        }
    }
}

impl Drop for TestPatternCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sine tone paced by the wall clock
pub struct ToneMicrophone {
    sample_rate: u32,
    channels: u32,
    frequency: f32,
    started: Option<Instant>,
    produced: u64,
    closed: bool,
}

impl ToneMicrophone {
    pub fn new(sample_rate: u32, channels: u32, frequency: f32) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frequency,
            started: None,
            produced: 0,
            closed: false,
        }
    }
}

impl Microphone for ToneMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        if self.closed {
            return Err(LivecastError::invalid_state("read", "closed"));
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        let channels = self.channels as usize;
        let wanted = (buf.len() / channels) as u64;

        // wait until the wall clock has produced a full buffer
        let ready_at = started
            + Duration::from_micros((self.produced + wanted) * 1_000_000 / self.sample_rate as u64);
        let now = Instant::now();
        if ready_at > now {
            std::thread::sleep((ready_at - now).min(timeout));
        }
        let elapsed = started.elapsed().as_micros() as u64;
        let available = (elapsed * self.sample_rate as u64 / 1_000_000).saturating_sub(self.produced);
        let frames = available.min(wanted) as usize;

        for i in 0..frames {
            let t = (self.produced + i as u64) as f32 / self.sample_rate as f32;
            let value = (t * self.frequency * std::f32::consts::TAU).sin() * 0.25 * i16::MAX as f32;
            for ch in 0..channels {
                buf[i * channels + ch] = value as i16;
            }
        }
        self.produced += frames as u64;
        Ok(frames * channels)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_dimensions() {
        let frame = TestPatternCamera::pattern(CameraId(0), 14, 2, 0);
        assert_eq!(frame.data.len(), 14 * 2 * 4);
        assert_eq!(&frame.data[..4], &[192, 192, 192, 255]);
    }

    #[test]
    fn test_cameras_differ() {
        let a = TestPatternCamera::pattern(CameraId(0), 14, 1, 0);
        let b = TestPatternCamera::pattern(CameraId(1), 14, 1, 0);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_tone_read_is_paced() {
        let mut mic = ToneMicrophone::new(8_000, 2, 440.0);
        let mut buf = vec![0i16; 160];
        let n = mic.read(&mut buf, Duration::from_millis(200)).unwrap();
        assert_eq!(n, 160);
        mic.close();
        assert!(mic.read(&mut buf, Duration::from_millis(1)).is_err());
    }
}
