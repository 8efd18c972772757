//! Connection-oriented socket helpers and the stream audio transport
//!
//! The stream backend behaves like an RFCOMM link: ordered and reliable,
//! but the peer may close it at any moment. Frames carry no header; the
//! reader slices the byte stream into fixed-size frames.

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::AudioFrame;
use crate::config::{SessionConfig, TransportKind};
use crate::error::NetworkError;
use crate::network::transport::TransportChannel;
use crate::network::{CancelToken, WaitError};

/// How often pending accepts/connects look at their deadline and token
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Longest a single connect attempt may take
const CONNECT_ATTEMPT: Duration = Duration::from_secs(1);

/// Writes that stall this long mean the peer is gone
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bind a listening socket on `addr`
pub fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    Ok(socket.into())
}

/// Accept one connection, giving up at the deadline or on cancellation
pub fn accept_one(
    listener: &TcpListener,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(TcpStream, SocketAddr), WaitError> {
    listener.set_nonblocking(true).map_err(WaitError::Io)?;
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false).map_err(WaitError::Io)?;
                return Ok((stream, addr));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(WaitError::TimedOut);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(WaitError::Io(e)),
        }
    }
}

/// Connect to `addr` from `local_ip`.
///
/// The peer may not be listening yet when the group forms, so refused
/// attempts are repeated until the single deadline passes.
pub fn connect_until(
    addr: SocketAddr,
    local_ip: IpAddr,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<TcpStream, WaitError> {
    let deadline = Instant::now() + timeout;
    let mut last_error: Option<std::io::Error> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(last_error.map(WaitError::Io).unwrap_or(WaitError::TimedOut));
        }

        let attempt = (deadline - now).min(CONNECT_ATTEMPT);
        match connect_once(addr, local_ip, attempt) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn connect_once(addr: SocketAddr, local_ip: IpAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if !local_ip.is_unspecified() {
        socket.bind(&SockAddr::from(SocketAddr::new(local_ip, 0)))?;
    }
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

/// Accumulates stream bytes across timed-out reads until a frame is whole
struct FrameReader {
    stream: TcpStream,
    buf: Vec<u8>,
    filled: usize,
}

impl FrameReader {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, NetworkError> {
        loop {
            match self.stream.read(&mut self.buf[self.filled..]) {
                Ok(0) => {
                    return Err(NetworkError::PeerDisconnected(
                        "stream closed by peer".to_string(),
                    ))
                }
                Ok(n) => {
                    self.filled += n;
                    if self.filled == self.buf.len() {
                        self.filled = 0;
                        return Ok(Some(AudioFrame::from_bytes(Bytes::copy_from_slice(
                            &self.buf,
                        ))));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(NetworkError::PeerDisconnected(e.to_string())),
            }
        }
    }
}

/// Frames over a single TCP connection
pub struct StreamTransport {
    writer: Mutex<TcpStream>,
    reader: Mutex<FrameReader>,
    control: TcpStream,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    frame_size: usize,
    closed: AtomicBool,
}

impl StreamTransport {
    /// Wrap an established connection
    pub fn from_stream(
        stream: TcpStream,
        frame_size: usize,
        read_timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let io_err = |e: std::io::Error| NetworkError::ConnectionFailed(e.to_string());

        stream.set_nodelay(true).map_err(io_err)?;
        stream.set_read_timeout(Some(read_timeout)).map_err(io_err)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT)).map_err(io_err)?;

        let reader = FrameReader {
            stream: stream.try_clone().map_err(io_err)?,
            buf: vec![0u8; frame_size],
            filled: 0,
        };
        let control = stream.try_clone().map_err(io_err)?;

        Ok(Self {
            local_addr: stream.local_addr().ok(),
            peer_addr: stream.peer_addr().ok(),
            writer: Mutex::new(stream),
            reader: Mutex::new(reader),
            control,
            frame_size,
            closed: AtomicBool::new(false),
        })
    }

    /// Server side: wait for the peer at `expected_peer` to connect.
    /// Connections from other hosts are turned away.
    pub fn accept(
        listen_addr: SocketAddr,
        expected_peer: IpAddr,
        config: &SessionConfig,
        cancel: &CancelToken,
    ) -> Result<Self, NetworkError> {
        let listener =
            listen(listen_addr).map_err(|e| NetworkError::BindFailed(format!("{listen_addr}: {e}")))?;
        tracing::info!("Stream transport listening on {}", listen_addr);

        let deadline = Instant::now() + config.accept_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (stream, addr) = accept_one(&listener, remaining, cancel)
                .map_err(|e| NetworkError::ConnectionFailed(format!("accept: {e}")))?;

            if addr.ip() == expected_peer {
                tracing::info!("Stream transport connected to {}", addr);
                return Self::from_stream(stream, config.frame_size, config.receive_timeout());
            }
            tracing::warn!("Rejecting audio connection from unexpected host {}", addr);
        }
    }

    /// Client side: connect to the peer's audio port
    pub fn connect(
        peer: SocketAddr,
        config: &SessionConfig,
        cancel: &CancelToken,
    ) -> Result<Self, NetworkError> {
        let stream = connect_until(peer, config.bind_address, config.connect_timeout(), cancel)
            .map_err(|e| NetworkError::ConnectionFailed(format!("{peer}: {e}")))?;
        tracing::info!("Stream transport connected to {}", peer);
        Self::from_stream(stream, config.frame_size, config.receive_timeout())
    }
}

impl TransportChannel for StreamTransport {
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

        let mut writer = self.writer.lock();
        writer.write_all(frame.as_bytes()).map_err(|e| {
            if self.closed.load(Ordering::SeqCst) {
                NetworkError::Closed
            } else {
                NetworkError::PeerDisconnected(e.to_string())
            }
        })
    }

    fn receive(&self) -> Result<Option<AudioFrame>, NetworkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        let result = self.reader.lock().read_frame();
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        result
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
            tracing::debug!("Stream transport to {:?} closed", self.peer_addr);
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
