//! Session lifecycle events

use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{ErrorKind, LivecastError};
use crate::types::EncoderState;

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 256;

/// Everything a host listens for
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: EncoderState,
        to: EncoderState,
    },
    /// Credentials resolved and buffered uploads flushed
    Started,
    /// First manifest reached the remote store
    Live { watch_url: String },
    Stopped,
    Error { kind: ErrorKind, detail: String },
    UploadCompleted {
        key: String,
        bytes: u64,
        bytes_per_sec: u64,
    },
    UploadFailed { key: String, detail: String },
    ThumbnailWritten { path: PathBuf },
}

impl SessionEvent {
    pub fn error(err: &LivecastError) -> Self {
        SessionEvent::Error {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// Publish side of the session event channel
///
/// Cloned into every thread that reports events. Sending never blocks and
/// succeeds with no subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        trace!("Event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(SessionEvent::Started);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::Started);
        bus.emit(SessionEvent::error(&LivecastError::protocol("late add_track")));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Started);
        match rx.try_recv().unwrap() {
            SessionEvent::Error { kind, detail } => {
                assert_eq!(kind, ErrorKind::ProtocolViolation);
                assert!(detail.contains("late add_track"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
