//! Datagram audio transport
//!
//! One frame per datagram, no acknowledgement, no retry. Lost or late
//! frames are simply gone; that is the right trade for live voice.

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::audio::AudioFrame;
use crate::config::TransportKind;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;
use crate::network::transport::TransportChannel;

/// Create a UDP socket bound to `addr` with a bounded read timeout
pub fn create_socket(addr: SocketAddr, read_timeout: Duration) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))?;
    socket
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket.into())
}

/// Frames over UDP to a single peer
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    peer: SocketAddr,
    frame_size: usize,
    recv_buffer: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind the local audio port and target `peer`
    pub fn bind(
        local: SocketAddr,
        peer: SocketAddr,
        frame_size: usize,
        read_timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let socket = create_socket(local, read_timeout)?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        tracing::info!("Datagram transport bound to {}, peer {}", local_addr, peer);

        Ok(Self {
            socket,
            local_addr,
            peer,
            frame_size,
            recv_buffer: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
            closed: AtomicBool::new(false),
        })
    }

    /// Datagrams from anyone but the peer are strays; datagrams from our own
    /// socket are echoes (both sides historically bound the same port).
    fn accepts_source(&self, source: SocketAddr) -> bool {
        source != self.local_addr && source.ip() == self.peer.ip()
    }
}

impl TransportChannel for UdpTransport {
    fn send(&self, frame: AudioFrame) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        if frame.len() != self.frame_size {
            return Err(NetworkError::FrameSize {
                expected: self.frame_size,
                actual: frame.len(),
            });
        }

        match self.socket.send_to(frame.as_bytes(), self.peer) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(n) => Err(NetworkError::Transient(format!(
                "short send: {n} of {} bytes",
                frame.len()
            ))),
            Err(e) => Err(NetworkError::Transient(e.to_string())),
        }
    }

    fn receive(&self) -> Result<Option<AudioFrame>, NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }

        let mut buf = self.recv_buffer.lock();
        let result = self.socket.recv_from(&mut buf);

        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }

        match result {
            Ok((n, source)) => {
                if !self.accepts_source(source) {
                    tracing::debug!("Ignoring datagram from {}", source);
                    return Ok(None);
                }
                if n != self.frame_size {
                    tracing::debug!("Dropping {}-byte datagram, expected {}", n, self.frame_size);
                    return Ok(None);
                }
                Ok(Some(AudioFrame::from_bytes(Bytes::copy_from_slice(&buf[..n]))))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(NetworkError::Transient(e.to_string())),
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Datagram transport on {} closed", self.local_addr);
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}
