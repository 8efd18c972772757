//! Network subsystem: address rendezvous and audio transports

pub mod rendezvous;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use rendezvous::{AddressExchange, ExchangeOutcome};
pub use tcp::StreamTransport;
pub use transport::{open_transport, TransportChannel};
pub use udp::{create_socket, UdpTransport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that aborts a pending accept or connect
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a bounded wait on a socket ended without a result
#[derive(Debug)]
pub enum WaitError {
    Cancelled,
    TimedOut,
    Io(std::io::Error),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Cancelled => f.write_str("cancelled"),
            WaitError::TimedOut => f.write_str("timed out"),
            WaitError::Io(e) => write!(f, "{e}"),
        }
    }
}
