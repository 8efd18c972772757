//! # Peer Voice
//!
//! Push-to-talk voice chat between exactly two devices sharing a direct
//! local link (a Wi-Fi Direct group or a paired stream connection).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Discovery / UI collaborator                       │
//! │   select_peer(descriptor)   begin/end_transmit()   disconnect()          │
//! └───────────────┬──────────────────────────────────────────▲───────────────┘
//!                 │                                          │ SessionEvent
//!                 ▼                                          │ (control thread)
//! ┌──────────────────────────────────────────────────────────┴───────────────┐
//! │                 PeerSessionManager (session::manager)                     │
//! │   Idle → Connecting → RoleNegotiation → Ready ⇄ Transmitting/Receiving   │
//! │                          │                         ↘ Failed / Disconnecting│
//! │                          ▼                                               │
//! │   ┌───────────────────────────────────┐                                  │
//! │   │ AddressExchange (network::rendezvous) TCP :4540                      │
//! │   │   owner  → accept one announce, record source address                │
//! │   │   client → connect to owner, send announce, close                    │
//! │   └───────────────────────────────────┘                                  │
//! │                          │ PeerEndpoint { role, address }                │
//! │                          ▼                                               │
//! │   ┌──────────────────────────────────────────────────────────────────┐  │
//! │   │             StreamingSession (session::streaming)                 │  │
//! │   │                                                                   │  │
//! │   │  transmit thread:  Microphone → AudioCapture ─▶ Transport.send    │  │
//! │   │  receive thread:   Transport.receive ─▶ AudioPlayback → Speaker   │  │
//! │   └──────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                  │  raw 16-bit LE mono PCM frames
//!                  ▼
//!        UDP :4541 (datagram)  or  TCP :4541 (stream)
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod ui;

pub use error::{Error, ErrorKind, Result};
pub use session::{PeerSessionManager, StreamingSession};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Canonical capture/playback sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

    /// Voice is mono end to end
    pub const CHANNELS: u16 = 1;

    /// Bytes per 16-bit PCM sample
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Default frame size in bytes (2048 samples)
    pub const DEFAULT_FRAME_SIZE: usize = 4096;

    /// Well-known port for the one-shot address announce
    pub const DEFAULT_RENDEZVOUS_PORT: u16 = 4540;

    /// Well-known port for audio frames
    pub const DEFAULT_AUDIO_PORT: u16 = 4541;

    /// Default HTTP port for the control surface
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Payload sent by the client during the rendezvous exchange
    pub const ANNOUNCE_MARKER: &[u8] = b"peer-voice/announce";

    /// Largest datagram we are willing to read
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;

    /// Frames buffered between the capture callback and the transmit loop
    pub const CAPTURE_QUEUE_FRAMES: usize = 32;

    /// Frames buffered between the receive loop and the output callback
    pub const PLAYBACK_QUEUE_FRAMES: usize = 8;

    /// Default bound on blocking socket reads so loops observe stop requests
    pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(200);

    /// Default rendezvous connect deadline
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default wait for the client's announce
    pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);
}
