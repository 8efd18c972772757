//! Audio transport abstraction

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::audio::AudioFrame;
use crate::config::{SessionConfig, TransportKind};
use crate::error::NetworkError;
use crate::network::tcp::StreamTransport;
use crate::network::udp::UdpTransport;
use crate::network::CancelToken;
use crate::protocol::Role;

/// Bidirectional frame channel to the resolved peer.
///
/// `send` and `receive` are called from different threads at the same time.
pub trait TransportChannel: Send + Sync {
    /// Transmit one frame to the peer.
    ///
    /// Datagram backends report local socket faults as
    /// [`NetworkError::Transient`]; stream backends report a broken
    /// connection as [`NetworkError::PeerDisconnected`].
    fn send(&self, frame: AudioFrame) -> Result<(), NetworkError>;

    /// Wait (bounded) for the next inbound frame.
    ///
    /// `Ok(None)` means nothing usable arrived before the timeout, or the
    /// datagram was filtered out. Returns [`NetworkError::Closed`] once
    /// [`shutdown`](TransportChannel::shutdown) has been called.
    fn receive(&self) -> Result<Option<AudioFrame>, NetworkError>;

    /// Close the channel, waking any blocked receiver. Idempotent.
    fn shutdown(&self);

    fn kind(&self) -> TransportKind;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Open the configured audio transport towards `peer_ip`.
///
/// For the stream backend the server side listens and the client side
/// connects; the datagram backend is symmetric and binds before returning
/// so no early frame finds the port closed.
pub fn open_transport(
    config: &SessionConfig,
    role: Role,
    peer_ip: IpAddr,
    cancel: &CancelToken,
) -> Result<Arc<dyn TransportChannel>, NetworkError> {
    let peer = SocketAddr::new(peer_ip, config.peer_audio_port());

    match config.transport {
        TransportKind::Datagram => {
            let transport = UdpTransport::bind(
                config.audio_bind_addr(),
                peer,
                config.frame_size,
                config.receive_timeout(),
            )?;
            Ok(Arc::new(transport))
        }
        TransportKind::Stream => {
            let transport = match role {
                Role::Server => StreamTransport::accept(
                    config.audio_bind_addr(),
                    peer_ip,
                    config,
                    cancel,
                )?,
                Role::Client => StreamTransport::connect(peer, config, cancel)?,
                Role::Unknown => {
                    return Err(NetworkError::ConnectionFailed(
                        "role not negotiated".to_string(),
                    ))
                }
            };
            Ok(Arc::new(transport))
        }
    }
}
