//! Livecast Core Library
//!
//! Capture, encode, segment and upload live audio/video.
//!
//! This library provides:
//! - A session state machine driving one video worker and one audio thread
//! - Hardware codec wrappers that drain into a shared muxer
//! - Direct-container and segmented (HLS / MPEG-TS) muxers
//! - A segment watcher and an ordered, single-threaded uploader
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────┐   ┌─────────┐   ┌──────────┐
//! │ FrameSource  │──▶│ VideoEncoder │──▶│        │   │         │   │          │
//! └──────────────┘   └──────────────┘   │ Muxer  │──▶│ Watcher │──▶│ Uploader │
//! ┌──────────────┐   ┌──────────────┐   │        │   │         │   │          │
//! │ AudioSource  │──▶│ AudioEncoder │──▶│        │   │         │   │          │
//! └──────────────┘   └──────────────┘   └────────┘   └─────────┘   └──────────┘
//! ```

pub mod capture;
pub mod config;
pub mod encode;
pub mod error;
pub mod mux;
pub mod platform;
pub mod session;
pub mod types;
pub mod upload;
pub mod watch;

pub use config::{ConfigFile, MuxerStrategy, Session, SessionBuilder};
pub use error::{ErrorKind, LivecastError, Result};
pub use platform::Platform;
pub use session::{Broadcaster, EventBus, SessionController, SessionEvent};
pub use types::{CameraId, EncoderState, Filter};
pub use upload::{StorageCredentials, UploadManager};

#[cfg(feature = "ffmpeg")]
pub use platform::SoftwarePlatform;
