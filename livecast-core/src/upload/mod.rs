//! Ordered segment uploads
//!
//! One FIFO queue and one uploader thread per credential set. Tasks queued
//! before credentials resolve are held and flushed in order once they do;
//! the uploader then transfers one task at a time so the remote store sees
//! segments in production order.

mod store;

pub use store::{FsStore, FsStoreProvider, RemoteStore, StorageCredentials, StoreProvider};
#[cfg(feature = "s3")]
pub use store::{S3Store, S3StoreProvider};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::error::{LivecastError, Result};
use crate::session::{EventBus, SessionEvent};
use crate::types::Segment;

/// One file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub destination_key: String,
    pub source_file: PathBuf,
    /// The uploader exits after this task
    pub is_terminal: bool,
}

impl UploadTask {
    pub fn new(destination_key: impl Into<String>, source_file: impl Into<PathBuf>) -> Self {
        Self {
            destination_key: destination_key.into(),
            source_file: source_file.into(),
            is_terminal: false,
        }
    }

    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }

    /// Upload of a finished output file; the last manifest ends the queue
    pub fn for_segment(destination_key: impl Into<String>, segment: &Segment) -> Self {
        Self {
            destination_key: destination_key.into(),
            source_file: segment.local_file.clone(),
            is_terminal: segment.is_manifest && segment.is_last,
        }
    }
}

/// Result of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed {
        bytes: u64,
        bytes_per_sec: u64,
        url: String,
    },
    Failed(String),
}

/// Called on the uploader thread after every transfer
pub type UploadListener = Arc<dyn Fn(&UploadTask, &UploadOutcome) + Send + Sync>;

enum Queue {
    /// Credentials not resolved yet
    Pending(VecDeque<UploadTask>),
    Active(Sender<UploadTask>),
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// Ordered upload queue with a single uploader thread
pub struct UploadManager {
    config: UploadConfig,
    provider: Arc<dyn StoreProvider>,
    events: EventBus,
    listener: Option<UploadListener>,
    queue: Arc<Mutex<Queue>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    exited: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl UploadManager {
    pub fn new(config: UploadConfig, provider: Arc<dyn StoreProvider>, events: EventBus) -> Self {
        Self {
            config,
            provider,
            events,
            listener: None,
            queue: Arc::new(Mutex::new(Queue::Pending(VecDeque::new()))),
            thread: Mutex::new(None),
            exited: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_listener(mut self, listener: UploadListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Queue a task; safe from any thread
    pub fn enqueue(&self, task: UploadTask) {
        let rejected = {
            let mut queue = self.queue.lock();
            match &mut *queue {
                Queue::Pending(pending) => {
                    debug!(
                        "Holding {} until credentials resolve ({} held)",
                        task.destination_key,
                        pending.len() + 1
                    );
                    pending.push_back(task);
                    None
                }
                Queue::Active(tx) => tx.send(task).err().map(|e| (e.0, "uploader has exited")),
                Queue::Closed if self.has_exited() => Some((task, "uploader has exited")),
                Queue::Closed => Some((task, "upload queue is closed")),
            }
        };
        if let Some((task, reason)) = rejected {
            self.reject(task, reason);
        }
    }

    fn reject(&self, task: UploadTask, reason: &str) {
        warn!("Upload of {} dropped: {}", task.destination_key, reason);
        report(
            &self.events,
            self.listener.as_ref(),
            &self.counters,
            &task,
            UploadOutcome::Failed(reason.to_string()),
        );
    }

    /// Connect the store, start the uploader and flush held tasks in order
    pub fn resolve_credentials(&self, credentials: &StorageCredentials) -> Result<()> {
        let rejected = self.start_uploader(credentials)?;
        for task in rejected {
            self.reject(task, "uploader has exited");
        }
        Ok(())
    }

    /// Returns the held tasks the uploader could not take
    fn start_uploader(&self, credentials: &StorageCredentials) -> Result<Vec<UploadTask>> {
        let mut queue = self.queue.lock();
        let Queue::Pending(pending) = &mut *queue else {
            return Err(LivecastError::invalid_state(
                "resolve_credentials",
                "credentials already resolved",
            ));
        };

        let store = self.provider.connect(credentials)?;
        info!("Credentials resolved ({}), uploading to {}", credentials, store.name());

        let (tx, rx) = mpsc::channel();
        let uploader = Uploader {
            store,
            rx,
            idle_timeout: self.config.idle_timeout,
            events: self.events.clone(),
            listener: self.listener.clone(),
            counters: Arc::clone(&self.counters),
            queue: Arc::clone(&self.queue),
            exited: Arc::clone(&self.exited),
        };
        let thread = std::thread::Builder::new()
            .name("livecast-upload".to_string())
            .spawn(move || uploader.run())
            .map_err(|e| LivecastError::upload(format!("Failed to spawn uploader: {}", e)))?;

        let held = pending.len();
        let mut rejected = Vec::new();
        for task in pending.drain(..) {
            if let Err(e) = tx.send(task) {
                rejected.push(e.0);
            }
        }
        if held > 0 {
            debug!("Flushed {} held uploads", held);
        }
        *queue = Queue::Active(tx);
        *self.thread.lock() = Some(thread);
        Ok(rejected)
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.queue.lock(), Queue::Active(_)) && !self.has_exited()
    }

    /// Tasks held waiting for credentials
    pub fn pending(&self) -> usize {
        match &*self.queue.lock() {
            Queue::Pending(pending) => pending.len(),
            _ => 0,
        }
    }

    /// Whether the uploader thread has finished
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::SeqCst)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.counters.bytes.load(Ordering::SeqCst)
    }

    /// Wait for the uploader to exit by itself (terminal task or timeout)
    pub fn join(&self) {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Uploader thread panicked");
            }
        }
    }

    /// Stop accepting tasks, let the uploader finish what it has, and wait
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.queue.lock(), Queue::Closed);
        match previous {
            Queue::Pending(pending) => {
                for task in pending {
                    self.reject(task, "credentials never resolved");
                }
            }
            // disconnects the uploader once it has drained the channel
            Queue::Active(tx) => drop(tx),
            Queue::Closed => {}
        }
        self.join();
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn report(
    events: &EventBus,
    listener: Option<&UploadListener>,
    counters: &Counters,
    task: &UploadTask,
    outcome: UploadOutcome,
) {
    match &outcome {
        UploadOutcome::Completed {
            bytes,
            bytes_per_sec,
            ..
        } => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
            counters.bytes.fetch_add(*bytes, Ordering::SeqCst);
            events.emit(SessionEvent::UploadCompleted {
                key: task.destination_key.clone(),
                bytes: *bytes,
                bytes_per_sec: *bytes_per_sec,
            });
        }
        UploadOutcome::Failed(detail) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            events.emit(SessionEvent::UploadFailed {
                key: task.destination_key.clone(),
                detail: detail.clone(),
            });
        }
    }
    if let Some(listener) = listener {
        listener(task, &outcome);
    }
}

struct Uploader {
    store: Box<dyn RemoteStore>,
    rx: Receiver<UploadTask>,
    idle_timeout: Option<Duration>,
    events: EventBus,
    listener: Option<UploadListener>,
    counters: Arc<Counters>,
    queue: Arc<Mutex<Queue>>,
    exited: Arc<AtomicBool>,
}

impl Uploader {
    fn run(mut self) {
        info!("Uploader started");
        loop {
            let task = match self.idle_timeout {
                Some(timeout) => match self.rx.recv_timeout(timeout) {
                    Ok(task) => task,
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            "No upload for {:?} and no terminal task seen, uploader exiting",
                            timeout
                        );
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(task) => task,
                    Err(_) => break,
                },
            };

            self.transfer(&task);
            if task.is_terminal {
                info!("Terminal upload {} done", task.destination_key);
                break;
            }
        }

        {
            // enqueue rejects from here on; the channel holds whatever got in before
            let mut queue = self.queue.lock();
            if matches!(*queue, Queue::Active(_)) {
                *queue = Queue::Closed;
            }
            self.exited.store(true, Ordering::SeqCst);
        }
        while let Ok(task) = self.rx.try_recv() {
            warn!("Upload of {} dropped: uploader has exited", task.destination_key);
            self.report(&task, UploadOutcome::Failed("uploader has exited".to_string()));
        }
        info!(
            "Uploader exited: {} uploaded, {} failed",
            self.counters.completed.load(Ordering::SeqCst),
            self.counters.failed.load(Ordering::SeqCst)
        );
    }

    fn transfer(&mut self, task: &UploadTask) {
        let started = Instant::now();
        let outcome = match self.store.put(&task.destination_key, &task.source_file) {
            Ok(bytes) => {
                let micros = started.elapsed().as_micros().max(1) as u64;
                let bytes_per_sec = bytes.saturating_mul(1_000_000) / micros;
                debug!(
                    "Uploaded {} ({} bytes, {} B/s)",
                    task.destination_key, bytes, bytes_per_sec
                );
                UploadOutcome::Completed {
                    bytes,
                    bytes_per_sec,
                    url: self.store.url_for(&task.destination_key),
                }
            }
            Err(e) => {
                error!("Upload of {} failed: {}", task.destination_key, e);
                UploadOutcome::Failed(e.to_string())
            }
        };
        self.report(task, outcome);
    }

    fn report(&self, task: &UploadTask, outcome: UploadOutcome) {
        report(&self.events, self.listener.as_ref(), &self.counters, task, outcome);
    }
}
