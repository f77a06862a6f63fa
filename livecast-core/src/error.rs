//! Error types for livecast

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using LivecastError
pub type Result<T> = std::result::Result<T, LivecastError>;

/// Main error type for livecast operations
#[derive(Debug, Error)]
pub enum LivecastError {
    /// Bad codec, session or file configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Capture device, microphone, GPU stage or codec could not be acquired
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// Codec failure while encoding or draining
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Muxer call ordering broken (addTrack after start, write before start, ...)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transfer to the remote store failed
    #[error("Upload error: {0}")]
    Upload(String),

    /// Command issued in a state that does not accept it
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Unsupported operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LivecastError>,
    },
}

/// Coarse error classification reported to session listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    HardwareUnavailable,
    Encoder,
    ProtocolViolation,
    TransientIo,
    InvalidState,
    Unsupported,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::HardwareUnavailable => "hardware-unavailable",
            Self::Encoder => "encoder",
            Self::ProtocolViolation => "protocol-violation",
            Self::TransientIo => "transient-io",
            Self::InvalidState => "invalid-state",
            Self::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

impl ErrorKind {
    /// Whether the session must be torn down after an error of this kind
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TransientIo | Self::InvalidState)
    }
}

impl LivecastError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a hardware-unavailable error
    pub fn hardware(msg: impl Into<String>) -> Self {
        Self::HardwareUnavailable(msg.into())
    }

    /// Create an encoder error
    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    /// Create a protocol violation
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create an upload error
    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context wrappers
    pub fn root(&self) -> &LivecastError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classification used in listener error events
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::Config(_) => ErrorKind::Configuration,
            Self::HardwareUnavailable(_) => ErrorKind::HardwareUnavailable,
            Self::Encoder(_) => ErrorKind::Encoder,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::Upload(_) | Self::Io(_) => ErrorKind::TransientIo,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::WithContext { source, .. } => source.kind(),
        }
    }

    /// Whether the session must be torn down after this error
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Short hint the CLI prints under the error
    pub fn user_hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::Config(_) => Some("Check the session parameters or ~/.config/livecast/config.toml"),
            Self::HardwareUnavailable(_) => {
                Some("Another process may hold the camera, microphone or encoder")
            }
            Self::Encoder(_) => Some("Try a lower resolution/bitrate or a different encoder"),
            Self::Upload(_) => Some("Uploads are not retried; re-run `livecast upload` on the recording"),
            Self::InvalidState { .. } => Some("Check `livecast record --help` for the command order"),
            Self::Unsupported(_) => Some("Rebuild with --features ffmpeg and/or s3"),
            _ => None,
        }
    }

    /// Whether the user can fix this without code changes
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::Config(_)
                | Self::HardwareUnavailable(_)
                | Self::Upload(_)
                | Self::InvalidState { .. }
                | Self::Unsupported(_)
        )
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<LivecastError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

// Conversions from external error types

impl From<toml::de::Error> for LivecastError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<image::ImageError> for LivecastError {
    fn from(err: image::ImageError) -> Self {
        Self::Io(std::io::Error::other(err.to_string()))
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for LivecastError {
    fn from(err: ffmpeg_next::Error) -> Self {
        Self::Encoder(err.to_string())
    }
}

#[cfg(feature = "s3")]
impl From<opendal::Error> for LivecastError {
    fn from(err: opendal::Error) -> Self {
        Self::Upload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_sees_through_context() {
        let err = LivecastError::protocol("write before start")
            .with_context("draining video")
            .with_context("frame 12");
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_upload_errors_are_not_fatal() {
        assert!(!LivecastError::upload("503").is_fatal());
        let io = LivecastError::from(std::io::Error::other("reset"));
        assert_eq!(io.kind(), ErrorKind::TransientIo);
    }
}
