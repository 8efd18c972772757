//! Error types for the voice session core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Address exchange failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Capture is not recording")]
    NotRecording,

    #[error("Playback is not running")]
    NotPlaying,

    #[error("Playback stalled, frame dropped")]
    Stalled,

    #[error("Stream error: {0}")]
    StreamError(String),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Transport closed")]
    Closed,

    #[error("Frame has {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
}

/// Role/address negotiation errors
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("connection descriptor has no owner address")]
    MissingOwnerAddress,

    #[error("could not reach owner at {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("no announce received: {0}")]
    AcceptFailed(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,
}

/// Session state machine errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Error taxonomy reported to the UI collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    ExchangeFailed,
    PeerDisconnected,
    TransientSendFailure,
    InvalidState,
    Configuration,
    Io,
}

impl Error {
    /// Shorthand for a rejected state transition
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::Session(SessionError::InvalidState(msg.into()))
    }

    /// Classify this error for the collaborator
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Audio(_) => ErrorKind::DeviceUnavailable,
            Error::Network(NetworkError::Transient(_)) => ErrorKind::TransientSendFailure,
            Error::Network(NetworkError::FrameSize { .. }) => ErrorKind::TransientSendFailure,
            Error::Network(NetworkError::PeerDisconnected(_)) => ErrorKind::PeerDisconnected,
            Error::Network(NetworkError::ConnectionFailed(_)) => ErrorKind::PeerDisconnected,
            Error::Network(NetworkError::Closed) => ErrorKind::PeerDisconnected,
            Error::Network(NetworkError::BindFailed(_)) => ErrorKind::Io,
            Error::Exchange(_) => ErrorKind::ExchangeFailed,
            Error::Session(SessionError::InvalidState(_)) => ErrorKind::InvalidState,
            Error::Config(_) => ErrorKind::Configuration,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::from(AudioError::DeviceUnavailable("mic".into())).kind(),
            ErrorKind::DeviceUnavailable
        );
        assert_eq!(
            Error::from(NetworkError::Transient("eagain".into())).kind(),
            ErrorKind::TransientSendFailure
        );
        assert_eq!(
            Error::from(ExchangeError::MissingOwnerAddress).kind(),
            ErrorKind::ExchangeFailed
        );
        assert_eq!(Error::invalid_state("busy").kind(), ErrorKind::InvalidState);
    }
}
