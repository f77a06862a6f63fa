//! Output directory watcher
//!
//! Reports every file the muxer finishes in the output directory, one
//! event per close (or rename into place), classified by extension.
//! Uses inotify directly; the muxer knows nothing about it.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{LivecastError, Result};
use crate::types::SegmentKind;

/// Poll timeout; bounds how long `stop` waits for the thread
const POLL_TIMEOUT_MS: i32 = 100;

const EVENT_BUFFER: usize = 4096;

/// A finished file in the watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEvent {
    pub kind: SegmentKind,
    /// Absolute path of the file
    pub path: PathBuf,
}

/// Watches one directory on a background thread
pub struct SegmentWatcher {
    dir: PathBuf,
    running: Arc<AtomicBool>,
    events: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SegmentWatcher {
    /// Start watching `dir`; `callback` runs on the watcher thread
    pub fn start<F>(dir: &Path, callback: F) -> Result<Self>
    where
        F: FnMut(SegmentEvent) + Send + 'static,
    {
        let dir = dir.canonicalize().map_err(|e| {
            LivecastError::Io(e).with_context(format!("Cannot watch {}", dir.display()))
        })?;
        let fd = add_watch(&dir)?;

        let running = Arc::new(AtomicBool::new(true));
        let events = Arc::new(AtomicU64::new(0));
        let thread = {
            let dir = dir.clone();
            let running = Arc::clone(&running);
            let events = Arc::clone(&events);
            std::thread::Builder::new()
                .name("livecast-watch".to_string())
                .spawn(move || watch_loop(fd, dir, running, events, callback))
                .map_err(|e| LivecastError::Io(e).with_context("Failed to spawn watcher"))?
        };

        info!("Watching {:?} for finished segments", dir);
        Ok(Self {
            dir,
            running,
            events,
            thread: Some(thread),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Events delivered so far
    pub fn events_delivered(&self) -> u64 {
        self.events.load(Ordering::SeqCst)
    }

    /// Deliver anything already queued, then stop
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Segment watcher thread panicked");
            }
            debug!("Segment watcher stopped after {} events", self.events_delivered());
        }
    }
}

impl Drop for SegmentWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn add_watch(dir: &Path) -> Result<OwnedFd> {
    let path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|_| LivecastError::config(format!("Path contains NUL: {:?}", dir)))?;

    // SAFETY: plain syscall; the returned descriptor is owned below
    let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
    if raw < 0 {
        return Err(LivecastError::Io(std::io::Error::last_os_error()).with_context("inotify_init1"));
    }
    // SAFETY: `raw` is a fresh descriptor nothing else owns
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: `path` is NUL-terminated and outlives the call
    let wd = unsafe {
        libc::inotify_add_watch(
            fd.as_raw_fd(),
            path.as_ptr(),
            libc::IN_CLOSE_WRITE | libc::IN_MOVED_TO,
        )
    };
    if wd < 0 {
        return Err(LivecastError::Io(std::io::Error::last_os_error())
            .with_context(format!("inotify_add_watch {}", dir.display())));
    }
    Ok(fd)
}

fn watch_loop<F>(fd: OwnedFd, dir: PathBuf, running: Arc<AtomicBool>, events: Arc<AtomicU64>, mut callback: F)
where
    F: FnMut(SegmentEvent),
{
    let mut buf = [0u8; EVENT_BUFFER];
    let mut deliver = |name: &Path| {
        let path = dir.join(name);
        match SegmentKind::from_path(&path) {
            Some(kind) => {
                debug!("{:?} finished: {:?}", kind, path);
                events.fetch_add(1, Ordering::SeqCst);
                callback(SegmentEvent { kind, path });
            }
            None => trace!("Ignoring {:?}", path),
        }
    };

    while running.load(Ordering::SeqCst) {
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd
        let ready = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("Segment watcher poll failed: {}", err);
            return;
        }
        if ready > 0 && read_events(&fd, &mut buf, &mut deliver).is_err() {
            return;
        }
    }
    // events queued before stop
    let _ = read_events(&fd, &mut buf, &mut deliver);
}

/// Read every queued inotify event; Err only on a fatal read error
fn read_events(fd: &OwnedFd, buf: &mut [u8], deliver: &mut impl FnMut(&Path)) -> std::result::Result<(), ()> {
    let header = std::mem::size_of::<libc::inotify_event>();
    loop {
        // SAFETY: `buf` is valid for `buf.len()` bytes
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock => Ok(()),
                std::io::ErrorKind::Interrupted => continue,
                _ => {
                    warn!("Segment watcher read failed: {}", err);
                    Err(())
                }
            };
        }
        let n = n as usize;
        if n == 0 {
            return Ok(());
        }

        let mut offset = 0;
        while offset + header <= n {
            // SAFETY: the kernel wrote a whole event header at `offset`
            let event: libc::inotify_event =
                unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr().cast()) };
            let name_start = offset + header;
            let name_end = (name_start + event.len as usize).min(n);
            offset = name_end;

            if event.mask & libc::IN_ISDIR != 0 || event.len == 0 {
                continue;
            }
            let raw = &buf[name_start..name_end];
            let name = raw.split(|b| *b == 0).next().unwrap_or(raw);
            deliver(Path::new(std::ffi::OsStr::from_bytes(name)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    fn wait_for(events: &Mutex<Vec<SegmentEvent>>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while events.lock().len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_classifies_closed_files() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut watcher = SegmentWatcher::start(dir.path(), move |e| sink.lock().push(e)).unwrap();

        std::fs::write(dir.path().join("index0.ts"), b"ts").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::write(dir.path().join("thumb_1.jpg"), b"jpg").unwrap();
        wait_for(&seen, 2);
        watcher.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].kind, SegmentKind::MediaSegment);
        assert!(seen[0].path.is_absolute());
        assert_eq!(seen[1].kind, SegmentKind::Thumbnail);
    }

    #[test]
    fn test_rename_into_place_is_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut watcher = SegmentWatcher::start(dir.path(), move |e| sink.lock().push(e)).unwrap();

        let tmp = dir.path().join("index.m3u8.tmp");
        std::fs::write(&tmp, b"#EXTM3U\n").unwrap();
        std::fs::rename(&tmp, dir.path().join("index.m3u8")).unwrap();
        wait_for(&seen, 1);
        std::thread::sleep(Duration::from_millis(50));
        watcher.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, SegmentKind::Manifest);
    }

    #[test]
    fn test_missing_directory() {
        assert!(SegmentWatcher::start(Path::new("/nonexistent/livecast"), |_| {}).is_err());
    }
}
