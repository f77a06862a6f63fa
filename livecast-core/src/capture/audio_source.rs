//! Microphone thread feeding the audio encoder

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::{Microphone, RecordingClock};
use crate::config::{Session, AUDIO_SAMPLES_PER_FRAME};
use crate::encode::{AudioClock, AudioEncoder};
use crate::error::{LivecastError, Result};
use crate::mux::SharedMuxer;
use crate::platform::Platform;
use crate::session::{EventBus, SessionEvent};
use crate::types::TrackIndex;

/// Bounded wait on each microphone read
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Recording,
    /// Flush the encoder and exit
    Stopping,
    /// Exit without flushing
    Quit,
}

struct Shared {
    phase: Mutex<Phase>,
    changed: Condvar,
    running: AtomicBool,
    samples_read: AtomicU64,
    /// Read before the first video frame fixed the clock
    samples_dropped: AtomicU64,
    track: Mutex<Option<TrackIndex>>,
}

/// Owns the microphone and the audio encoder on a dedicated thread
pub struct AudioSource {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSource {
    /// Open the microphone and encoder, then park the thread until `start`
    pub fn spawn(
        platform: Arc<dyn Platform>,
        session: &Session,
        muxer: SharedMuxer,
        clock: RecordingClock,
        events: EventBus,
    ) -> Result<Self> {
        let encoder = AudioEncoder::create(platform.as_ref(), &session.audio, muxer)?;
        let microphone = platform.open_microphone(&session.audio)?;

        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Waiting),
            changed: Condvar::new(),
            running: AtomicBool::new(true),
            samples_read: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            track: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("livecast-audio".to_string())
            .spawn(move || {
                let mut worker = AudioWorker {
                    clock,
                    events,
                    shared: Arc::clone(&thread_shared),
                    audio_clock: AudioClock::new(microphone.sample_rate()),
                    microphone: Some(microphone),
                    encoder: Some(encoder),
                    next_pts: 0,
                    recorded: false,
                };
                worker.run();
                thread_shared.running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| LivecastError::hardware(format!("Failed to spawn audio thread: {}", e)))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn start(&self) {
        self.set_phase(Phase::Recording);
    }

    /// Flush the encoder and exit; returns immediately
    pub fn stop(&self) {
        self.set_phase(Phase::Stopping);
    }

    fn set_phase(&self, phase: Phase) {
        let mut current = self.shared.phase.lock();
        // never step back from an exit request
        if matches!(*current, Phase::Stopping | Phase::Quit) {
            return;
        }
        *current = phase;
        self.shared.changed.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Interleaved samples read from the microphone
    pub fn samples_read(&self) -> u64 {
        self.shared.samples_read.load(Ordering::SeqCst)
    }

    /// Samples discarded while waiting for the first video frame
    pub fn samples_dropped(&self) -> u64 {
        self.shared.samples_dropped.load(Ordering::SeqCst)
    }

    pub fn audio_track(&self) -> Option<TrackIndex> {
        *self.shared.track.lock()
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio thread panicked");
            }
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.set_phase(Phase::Quit);
            self.join();
        }
    }
}

struct AudioWorker {
    clock: RecordingClock,
    events: EventBus,
    shared: Arc<Shared>,
    audio_clock: AudioClock,
    microphone: Option<Box<dyn Microphone>>,
    encoder: Option<AudioEncoder>,
    next_pts: i64,
    recorded: bool,
}

impl AudioWorker {
    fn run(&mut self) {
        debug!("Audio thread waiting for start");
        let channels = self
            .microphone
            .as_ref()
            .map(|m| m.channels() as usize)
            .unwrap_or(1);
        let mut buf = vec![0i16; AUDIO_SAMPLES_PER_FRAME * channels];

        loop {
            let phase = {
                let mut phase = self.shared.phase.lock();
                while *phase == Phase::Waiting {
                    self.shared.changed.wait(&mut phase);
                }
                *phase
            };

            match phase {
                Phase::Recording => {
                    self.recorded = true;
                    if let Err(e) = self.capture(&mut buf, channels) {
                        error!("Audio capture failed: {}", e);
                        self.events.emit(SessionEvent::error(&e));
                        break;
                    }
                }
                Phase::Stopping => {
                    // nothing to flush if recording never began
                    if self.recorded {
                        self.finish();
                    }
                    break;
                }
                Phase::Quit | Phase::Waiting => break,
            }
        }
        self.release();
        info!("Audio thread exited");
    }

    fn capture(&mut self, buf: &mut [i16], channels: usize) -> Result<()> {
        let (Some(microphone), Some(encoder)) = (self.microphone.as_mut(), self.encoder.as_mut())
        else {
            return Err(LivecastError::invalid_state("capture", "released"));
        };
        let n = microphone.read(buf, READ_TIMEOUT)?;
        if n == 0 {
            return Ok(());
        }
        self.shared.samples_read.fetch_add(n as u64, Ordering::SeqCst);

        let Some(origin) = self.clock.origin() else {
            self.shared.samples_dropped.fetch_add(n as u64, Ordering::SeqCst);
            trace!("No video frame yet, dropping {} audio samples", n);
            return Ok(());
        };
        let frames = n / channels;
        let pts = self.audio_clock.next_pts_at(origin, Instant::now(), frames);
        self.next_pts = pts + (frames as i64 * 1_000_000) / microphone.sample_rate().max(1) as i64;
        encoder.encode(&buf[..n], pts, false)?;

        if let Some(track) = encoder.track_index() {
            *self.shared.track.lock() = Some(track);
        }
        Ok(())
    }

    fn finish(&mut self) {
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        match encoder.encode(&[], self.next_pts, true) {
            Ok(_) => info!(
                "Audio drained: {} samples written",
                encoder.stats().samples_written
            ),
            Err(e) => {
                error!("Final audio drain failed: {}", e);
                self.events.emit(SessionEvent::error(&e));
            }
        }
        if let Some(track) = encoder.track_index() {
            *self.shared.track.lock() = Some(track);
        }
        if self.audio_clock.reanchors() > 0 {
            warn!(
                "Audio clock re-anchored {} times",
                self.audio_clock.reanchors()
            );
        }
    }

    fn release(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.release();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.close();
        }
    }
}
